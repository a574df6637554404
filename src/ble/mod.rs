//! BLE communication module.
//!
//! This module provides scanning, connection sessions and characteristic
//! access on top of the [`stack`] traits, plus the `btleplug` backend.

pub mod characteristics;
pub mod connection;
pub mod platform;
pub mod scanner;
pub mod stack;
pub mod uuids;

pub use characteristics::{CharacteristicObserver, CharacteristicReader, CharacteristicStream};
pub use connection::{ConnectionManager, ConnectionSession, ConnectionState, PeripheralHandle};
pub use platform::{BtleplugCentral, BtleplugCharacteristic, BtleplugPeripheral};
pub use scanner::{PeripheralScanner, PeripheralSummary};
pub use stack::{
    Advertisement, Central, GattService, PeripheralAddress, RemoteCharacteristic,
    RemotePeripheral, ScanFilter, ScanPermit,
};
pub use uuids::*;
