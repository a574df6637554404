// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # peripheral-link
//!
//! A cross-platform Rust library for scanning, connecting to and streaming
//! characteristics from Bluetooth Low Energy peripherals.
//!
//! Every operation is exposed as a lazy stream or future: nothing touches the
//! radio until it is polled, and dropping it releases whatever it acquired
//! (scan slot, connection, notification subscription).
//!
//! ## Features
//!
//! - **Scanning**: Service-filtered discovery, one entry per peripheral
//! - **Connection Sessions**: Connect on demand, disconnect exactly once
//! - **Notifications**: Characteristic streams that survive re-discovery
//! - **Reads**: One-shot characteristic reads with decoding
//! - **Host Events**: Bridge callback-based listener APIs into streams
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use peripheral_link::{BleManager, Result, BATTERY_SERVICE_UUID};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = BleManager::new().await?;
//!
//!     // Find the first peripheral with a battery service
//!     let mut scan = manager.scan([BATTERY_SERVICE_UUID]);
//!     let Some(found) = scan.next().await.transpose()? else {
//!         return Ok(());
//!     };
//!     drop(scan);
//!
//!     // Hold the session open while using the handle
//!     let mut session = manager.connect(found.address);
//!     while let Some(handle) = session.next().await.transpose()? {
//!         let Some(handle) = handle else { continue };
//!
//!         let info = manager.device_information(&handle).await?;
//!         println!("Connected to {:?}", info.model_number);
//!
//!         let mut levels = manager.observe_battery_level(&handle);
//!         while let Some(level) = levels.next().await {
//!             println!("Battery: {}%", level);
//!         }
//!         levels.close().await;
//!     }
//!
//!     // Wait for the disconnect instead of leaving it to drop
//!     session.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Peripheral addresses are
//! platform-assigned identifiers, not MAC addresses.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod event_bridge;
pub mod manager;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::BleConfig;
pub use error::{Error, Result};
pub use event_bridge::{EventBridge, EventCallback, EventSource, EventStream, ListenerId};
pub use manager::{BleManager, DeviceInformation};
pub use utils::{decode_battery_level, decode_utf8, to_hex};

// Re-export commonly used types from submodules
pub use ble::characteristics::{CharacteristicObserver, CharacteristicReader, CharacteristicStream};
pub use ble::connection::{ConnectionManager, ConnectionSession, ConnectionState, PeripheralHandle};
pub use ble::scanner::{PeripheralScanner, PeripheralSummary};
pub use ble::stack::{Central, PeripheralAddress, RemoteCharacteristic, RemotePeripheral, ScanPermit};
pub use ble::uuids::{
    BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID, MANUFACTURER_NAME_UUID,
    MODEL_NUMBER_UUID, SERIAL_NUMBER_UUID,
};
