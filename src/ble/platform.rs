//! `btleplug` backend.
//!
//! Maps the host Bluetooth stack onto [`Central`], [`RemotePeripheral`] and
//! [`RemoteCharacteristic`].

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter as HostScanFilter, Service,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::ble::stack::{
    Advertisement, Central, GattService, PeripheralAddress, RemoteCharacteristic,
    RemotePeripheral, ScanFilter, ScanPermit,
};
use crate::config::BleConfig;
use crate::error::{Error, Result};

/// The host Bluetooth adapter.
#[derive(Clone)]
pub struct BtleplugCentral {
    adapter: Adapter,
    scan_buffer: usize,
}

impl BtleplugCentral {
    /// Open the adapter selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`] if Bluetooth is not available
    /// or the adapter index does not exist.
    pub async fn new(config: &BleConfig) -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| {
            warn!("Failed to open Bluetooth manager: {}", e);
            Error::HardwareUnavailable
        })?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .nth(config.adapter_index)
            .ok_or(Error::HardwareUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, config))
    }

    /// Use an already opened adapter.
    pub fn with_adapter(adapter: Adapter, config: &BleConfig) -> Self {
        Self {
            adapter,
            scan_buffer: config.scan_buffer.max(1),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

#[async_trait]
impl Central for BtleplugCentral {
    type Peripheral = BtleplugPeripheral;

    fn scan(
        &self,
        filter: ScanFilter,
        permit: ScanPermit,
    ) -> BoxStream<'static, Result<Advertisement<BtleplugPeripheral>>> {
        let (tx, rx) = mpsc::channel(self.scan_buffer);
        tokio::spawn(run_scan(self.adapter.clone(), filter, permit, tx));

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    async fn connect(&self, peripheral: &BtleplugPeripheral) -> Result<()> {
        peripheral
            .peripheral
            .connect()
            .await
            .map_err(|e| Error::ConnectFailed {
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self, peripheral: &BtleplugPeripheral) -> Result<()> {
        peripheral.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Scan until the consumer goes away, then stop the hardware scan.
///
/// `permit` is released only after `stop_scan` has returned.
async fn run_scan(
    adapter: Adapter,
    filter: ScanFilter,
    permit: ScanPermit,
    tx: mpsc::Sender<Result<Advertisement<BtleplugPeripheral>>>,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Failed to get adapter events: {}", e);
            let _ = tx.send(Err(Error::HardwareUnavailable)).await;
            return;
        }
    };

    if let Err(e) = adapter.start_scan(host_filter(&filter)).await {
        warn!("Failed to start scan: {}", e);
        let _ = tx.send(Err(Error::HardwareUnavailable)).await;
        return;
    }

    loop {
        tokio::select! {
            _ = tx.closed() => break,
            event = events.next() => match event {
                Some(
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. },
                ) => {
                    let Some(advertisement) = advertisement(&adapter, &id).await else {
                        continue;
                    };
                    if !filter.matches(&advertisement) {
                        continue;
                    }
                    if tx.send(Ok(advertisement)).await.is_err() {
                        break;
                    }
                }
                Some(event) => trace!("Ignoring central event: {:?}", event),
                None => {
                    warn!("Adapter event stream ended");
                    let _ = tx.send(Err(Error::HardwareUnavailable)).await;
                    break;
                }
            },
        }
    }

    if let Err(e) = adapter.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }
    drop(permit);
}

/// The hardware filter. Address filtering is done on our side.
fn host_filter(filter: &ScanFilter) -> HostScanFilter {
    HostScanFilter {
        services: filter.services.clone(),
    }
}

/// Build an advertisement from the adapter's view of a peripheral.
async fn advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement<BtleplugPeripheral>> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(p) => p,
        Err(e) => {
            trace!("Failed to get peripheral: {}", e);
            return None;
        }
    };

    let properties = peripheral.properties().await.ok()??;
    let address = PeripheralAddress::new(peripheral.id().to_string());

    Some(advertisement_from(
        BtleplugPeripheral {
            adapter: adapter.clone(),
            peripheral,
        },
        address,
        properties,
    ))
}

fn advertisement_from<P>(
    peripheral: P,
    address: PeripheralAddress,
    properties: PeripheralProperties,
) -> Advertisement<P> {
    Advertisement {
        peripheral,
        address,
        name: properties.local_name,
        // The host stack does not report connectability.
        connectable: true,
        services: properties.services,
    }
}

/// A peripheral known to the host adapter.
#[derive(Debug, Clone)]
pub struct BtleplugPeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
}

impl BtleplugPeripheral {
    /// Get the underlying peripheral.
    pub fn inner(&self) -> &Peripheral {
        &self.peripheral
    }
}

impl RemotePeripheral for BtleplugPeripheral {
    type Characteristic = BtleplugCharacteristic;

    fn address(&self) -> PeripheralAddress {
        PeripheralAddress::new(self.peripheral.id().to_string())
    }

    fn connection_state(&self) -> BoxStream<'static, ConnectionState> {
        let adapter = self.adapter.clone();
        let peripheral = self.peripheral.clone();

        stream::once(async move {
            // Subscribe before sampling so no transition is missed.
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Failed to get adapter events: {}", e);
                    return stream::empty().boxed();
                }
            };

            let initial = if peripheral.is_connected().await.unwrap_or(false) {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };

            let id = peripheral.id();
            let updates = events.filter_map(move |event| {
                future::ready(match event {
                    CentralEvent::DeviceConnected(other) => state_update(&id, &other, true),
                    CentralEvent::DeviceDisconnected(other) => state_update(&id, &other, false),
                    _ => None,
                })
            });

            stream::once(future::ready(initial)).chain(updates).boxed()
        })
        .flatten()
        .boxed()
    }

    fn services(&self, filter: Vec<Uuid>) -> BoxStream<'static, Vec<GattService<BtleplugCharacteristic>>> {
        let peripheral = self.peripheral.clone();

        self.connection_state()
            .then(move |state| {
                let peripheral = peripheral.clone();
                let filter = filter.clone();
                async move {
                    if !state.is_connected() {
                        return Vec::new();
                    }
                    if let Err(e) = peripheral.discover_services().await {
                        warn!("Service discovery failed: {}", e);
                        return Vec::new();
                    }
                    discovered(&peripheral, &filter)
                }
            })
            .boxed()
    }
}

/// State reported by a connection event, if it concerns `id`.
fn state_update<I: PartialEq>(id: &I, subject: &I, connected: bool) -> Option<ConnectionState> {
    if id != subject {
        return None;
    }

    Some(if connected {
        ConnectionState::Connected
    } else {
        ConnectionState::Disconnected
    })
}

/// Services of one discovery round matching `filter` (empty matches all).
fn select_services(services: BTreeSet<Service>, filter: &[Uuid]) -> Vec<Service> {
    services
        .into_iter()
        .filter(|s| filter.is_empty() || filter.contains(&s.uuid))
        .collect()
}

fn discovered(peripheral: &Peripheral, filter: &[Uuid]) -> Vec<GattService<BtleplugCharacteristic>> {
    let services: Vec<_> = select_services(peripheral.services(), filter)
        .into_iter()
        .map(|s| GattService {
            uuid: s.uuid,
            characteristics: s
                .characteristics
                .into_iter()
                .map(|characteristic| BtleplugCharacteristic {
                    peripheral: peripheral.clone(),
                    characteristic,
                })
                .collect(),
        })
        .collect();

    debug!("Discovered {} matching services", services.len());
    services
}

/// A characteristic of a connected peripheral.
#[derive(Debug, Clone)]
pub struct BtleplugCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

#[async_trait]
impl RemoteCharacteristic for BtleplugCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        let notifications = self.peripheral.notifications().await?;
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(|e| Error::Subscription {
                reason: e.to_string(),
            })?;

        let uuid = self.characteristic.uuid;
        Ok(notifications
            .filter(move |notification| future::ready(notification.uuid == uuid))
            .map(|notification| Ok(notification.value))
            .boxed())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.peripheral.unsubscribe(&self.characteristic).await?;
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>> {
        Ok(self.peripheral.read(&self.characteristic).await?)
    }
}
