//! BLE manager.
//!
//! Ties the scanner, connection sessions and characteristic access to one
//! central, and adds readers for the standard Device Information and Battery
//! services.

use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ble::characteristics::{CharacteristicObserver, CharacteristicReader, CharacteristicStream};
use crate::ble::connection::{ConnectionManager, ConnectionSession, PeripheralHandle};
use crate::ble::platform::BtleplugCentral;
use crate::ble::scanner::{PeripheralScanner, PeripheralSummary};
use crate::ble::stack::{Central, PeripheralAddress};
use crate::ble::uuids::{
    BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID, MANUFACTURER_NAME_UUID,
    MODEL_NUMBER_UUID, SERIAL_NUMBER_UUID,
};
use crate::config::BleConfig;
use crate::error::{Error, Result};
use crate::utils::{decode_battery_level, decode_utf8};

/// Contents of the Device Information service.
///
/// Fields are `None` when the peripheral does not expose them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInformation {
    /// Manufacturer name string.
    pub manufacturer_name: Option<String>,
    /// Serial number string.
    pub serial_number: Option<String>,
    /// Model number string.
    pub model_number: Option<String>,
}

/// Central manager for scanning, connecting and characteristic access.
pub struct BleManager<C: Central = BtleplugCentral> {
    /// Shared scanner (and scan gate).
    scanner: PeripheralScanner<C>,
    /// Connection sessions.
    connections: ConnectionManager<C>,
    /// Notification streams.
    observer: CharacteristicObserver,
    /// One-shot reads.
    reader: CharacteristicReader,
    config: BleConfig,
}

impl BleManager<BtleplugCentral> {
    /// Create a manager on the default Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(BleConfig::default()).await
    }

    /// Create a manager with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured adapter is not available.
    pub async fn with_config(config: BleConfig) -> Result<Self> {
        let central = BtleplugCentral::new(&config).await?;
        Ok(Self::with_central(central, config))
    }
}

impl<C: Central> BleManager<C> {
    /// Create a manager on any [`Central`] implementation.
    pub fn with_central(central: C, config: BleConfig) -> Self {
        let central = Arc::new(central);
        let scanner = PeripheralScanner::new(central.clone());

        Self {
            connections: ConnectionManager::new(central, scanner.clone()),
            scanner,
            observer: CharacteristicObserver::new(config.notification_buffer),
            reader: CharacteristicReader,
            config,
        }
    }

    /// Get the active configuration.
    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    /// Scan for peripherals advertising any of `services`.
    ///
    /// See [`PeripheralScanner::scan`].
    pub fn scan(
        &self,
        services: impl IntoIterator<Item = Uuid>,
    ) -> BoxStream<'static, Result<PeripheralSummary>> {
        self.scanner.scan(services)
    }

    /// Open a connection session.
    ///
    /// See [`ConnectionManager::connect`].
    pub fn connect(&self, address: impl Into<PeripheralAddress>) -> ConnectionSession<C::Peripheral> {
        self.connections.connect(address)
    }

    /// Observe a characteristic's notifications.
    ///
    /// See [`CharacteristicObserver::observe`].
    pub fn observe<T, F>(
        &self,
        handle: &PeripheralHandle<C::Peripheral>,
        service: Uuid,
        characteristic: Uuid,
        decode: F,
    ) -> CharacteristicStream<T>
    where
        T: fmt::Debug + Send + 'static,
        F: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    {
        self.observer.observe(handle, service, characteristic, decode)
    }

    /// Read a characteristic once.
    ///
    /// See [`CharacteristicReader::read`].
    pub async fn read<T, F>(
        &self,
        handle: &PeripheralHandle<C::Peripheral>,
        service: Uuid,
        characteristic: Uuid,
        decode: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        self.reader.read(handle, service, characteristic, decode).await
    }

    /// Read the Device Information service.
    ///
    /// A field that cannot be read or decoded is logged and left `None`.
    /// Only [`Error::HandleExpired`] is returned.
    pub async fn device_information(
        &self,
        handle: &PeripheralHandle<C::Peripheral>,
    ) -> Result<DeviceInformation> {
        let info = DeviceInformation {
            manufacturer_name: self.read_info_string(handle, MANUFACTURER_NAME_UUID).await?,
            serial_number: self.read_info_string(handle, SERIAL_NUMBER_UUID).await?,
            model_number: self.read_info_string(handle, MODEL_NUMBER_UUID).await?,
        };

        debug!("Device information for {}: {:?}", handle.address(), info);
        Ok(info)
    }

    async fn read_info_string(
        &self,
        handle: &PeripheralHandle<C::Peripheral>,
        characteristic: Uuid,
    ) -> Result<Option<String>> {
        match self
            .read(handle, DEVICE_INFO_SERVICE_UUID, characteristic, decode_utf8)
            .await
        {
            Err(Error::HandleExpired) => Err(Error::HandleExpired),
            Err(e) => {
                warn!("Skipping device information {}: {}", characteristic, e);
                Ok(None)
            }
            Ok(value) => Ok(value),
        }
    }

    /// Observe Battery Level notifications as percentages.
    pub fn observe_battery_level(&self, handle: &PeripheralHandle<C::Peripheral>) -> CharacteristicStream<u8> {
        self.observe(handle, BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID, decode_battery_level)
    }

    /// Read the battery level once.
    pub async fn read_battery_level(&self, handle: &PeripheralHandle<C::Peripheral>) -> Result<Option<u8>> {
        self.read(handle, BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID, decode_battery_level)
            .await
    }
}
