//! The BLE stack consumed by this crate.
//!
//! Scanning, sessions and characteristic streams are written against these
//! traits rather than a concrete backend. [`crate::ble::platform`] provides
//! the `btleplug` implementation used in production.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::error::Result;

/// Opaque identity of a peripheral, stable across scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    /// Wrap a platform address string.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PeripheralAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Filter passed to [`Central::scan`].
///
/// An empty service list matches any advertiser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Advertised services of interest.
    pub services: Vec<Uuid>,
    /// Restrict the scan to a single peripheral.
    pub address: Option<PeripheralAddress>,
}

impl ScanFilter {
    /// Filter on advertised services.
    pub fn services(services: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            services: services.into_iter().collect(),
            address: None,
        }
    }

    /// Filter on one exact address.
    pub fn address(address: PeripheralAddress) -> Self {
        Self {
            services: Vec::new(),
            address: Some(address),
        }
    }

    /// Check an advertisement against this filter.
    ///
    /// Some platforms ignore the hardware filter, so callers re-check.
    pub fn matches<P>(&self, advertisement: &Advertisement<P>) -> bool {
        if let Some(address) = &self.address {
            if *address != advertisement.address {
                return false;
            }
        }

        self.services.is_empty()
            || self
                .services
                .iter()
                .any(|uuid| advertisement.services.contains(uuid))
    }
}

/// Exclusive right to run the hardware scan.
///
/// Handed to [`Central::scan`], which must keep it until the hardware scan
/// has actually stopped. The next scan cannot start before it is dropped.
pub struct ScanPermit {
    _slot: OwnedMutexGuard<()>,
    filter: ScanFilter,
}

impl ScanPermit {
    pub(crate) fn new(slot: OwnedMutexGuard<()>, filter: ScanFilter) -> Self {
        Self { _slot: slot, filter }
    }
}

impl fmt::Debug for ScanPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanPermit")
            .field("filter", &self.filter)
            .finish()
    }
}

impl Drop for ScanPermit {
    fn drop(&mut self) {
        debug!("Scan with filter {:?} stopped", self.filter);
    }
}

/// One advertisement as delivered by the stack.
#[derive(Debug, Clone)]
pub struct Advertisement<P> {
    /// Stack reference used to connect to the advertiser.
    pub peripheral: P,
    /// Address of the advertiser.
    pub address: PeripheralAddress,
    /// Advertised local name.
    pub name: Option<String>,
    /// Whether the advertiser accepts connections.
    pub connectable: bool,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

/// One discovered GATT service.
#[derive(Debug, Clone)]
pub struct GattService<C> {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of the service.
    pub characteristics: Vec<C>,
}

impl<C: RemoteCharacteristic> GattService<C> {
    /// Find a characteristic of this service by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&C> {
        self.characteristics.iter().find(|c| c.uuid() == *uuid)
    }
}

/// Resolve `service`/`characteristic` within one discovery round.
pub(crate) fn find_characteristic<C: RemoteCharacteristic>(
    services: &[GattService<C>],
    service: &Uuid,
    characteristic: &Uuid,
) -> Option<C> {
    services
        .iter()
        .find(|s| s.uuid == *service)
        .and_then(|s| s.characteristic(characteristic))
        .cloned()
}

/// The radio ("central") role.
#[async_trait]
pub trait Central: Send + Sync + 'static {
    /// Peripheral reference type produced by scans.
    type Peripheral: RemotePeripheral;

    /// Start scanning.
    ///
    /// Hardware scanning stays active until the returned stream is dropped.
    /// `permit` must be held until the hardware scan has stopped, including
    /// when stopping completes asynchronously. A radio failure is delivered
    /// as an error item.
    fn scan(
        &self,
        filter: ScanFilter,
        permit: ScanPermit,
    ) -> BoxStream<'static, Result<Advertisement<Self::Peripheral>>>;

    /// Issue a connect request.
    async fn connect(&self, peripheral: &Self::Peripheral) -> Result<()>;

    /// Issue a disconnect request.
    async fn disconnect(&self, peripheral: &Self::Peripheral) -> Result<()>;
}

/// A peripheral reference obtained from a scan.
pub trait RemotePeripheral: Clone + Send + Sync + fmt::Debug + 'static {
    /// Characteristic type of this stack.
    type Characteristic: RemoteCharacteristic;

    /// Address of the peripheral.
    fn address(&self) -> PeripheralAddress;

    /// Connection state updates, starting with the current state.
    fn connection_state(&self) -> BoxStream<'static, ConnectionState>;

    /// Discovered service sets restricted to `filter`.
    ///
    /// A new set is yielded on every discovery round, including an empty set
    /// when the services disappear.
    fn services(&self, filter: Vec<Uuid>) -> BoxStream<'static, Vec<GattService<Self::Characteristic>>>;
}

/// A characteristic of a discovered service.
#[async_trait]
pub trait RemoteCharacteristic: Clone + Send + Sync + fmt::Debug + 'static {
    /// Characteristic UUID.
    fn uuid(&self) -> Uuid;

    /// Enable notifications and return the payload stream.
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<Vec<u8>>>>;

    /// Disable notifications.
    async fn unsubscribe(&self) -> Result<()>;

    /// Read the current value once.
    async fn read(&self) -> Result<Vec<u8>>;
}
