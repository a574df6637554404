//! BLE scanning functionality.
//!
//! Provides the scanner for discovering advertising peripherals. All scans
//! of one central go through a single FIFO gate, so at most one hardware
//! scan is active per process.

use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::stack::{Advertisement, Central, PeripheralAddress, ScanFilter, ScanPermit};
use crate::error::Result;

/// A discovered peripheral, emitted once per address per scan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralSummary {
    /// The peripheral address.
    pub address: PeripheralAddress,
    /// Advertised local name, if any.
    pub name: Option<String>,
}

/// BLE scanner for discovering peripherals.
pub struct PeripheralScanner<C: Central> {
    /// The radio to scan with.
    central: Arc<C>,
    /// The single "current scan" slot, held until the hardware stops.
    gate: Arc<Mutex<()>>,
}

impl<C: Central> Clone for PeripheralScanner<C> {
    fn clone(&self) -> Self {
        Self {
            central: self.central.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl<C: Central> PeripheralScanner<C> {
    /// Create a scanner for a central.
    pub fn new(central: Arc<C>) -> Self {
        Self {
            central,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Scan for peripherals advertising any of `services`.
    ///
    /// Nothing happens until the stream is polled. Each address is emitted at
    /// most once; hardware scanning stops when the stream is dropped. If the
    /// radio is unavailable the stream yields one error and ends.
    pub fn scan(
        &self,
        services: impl IntoIterator<Item = Uuid>,
    ) -> BoxStream<'static, Result<PeripheralSummary>> {
        let mut seen = HashSet::new();

        self.advertisements(ScanFilter::services(services))
            .try_filter_map(move |advertisement| {
                let summary = if seen.insert(advertisement.address.clone()) {
                    trace!(
                        "Discovered {} ({:?})",
                        advertisement.address,
                        advertisement.name
                    );
                    Some(PeripheralSummary {
                        address: advertisement.address,
                        name: advertisement.name,
                    })
                } else {
                    None
                };
                future::ready(Ok(summary))
            })
            .boxed()
    }

    /// Scan for one exact address, yielding raw advertisements.
    pub(crate) fn locate(
        &self,
        address: PeripheralAddress,
    ) -> BoxStream<'static, Result<Advertisement<C::Peripheral>>> {
        self.advertisements(ScanFilter::address(address))
    }

    fn advertisements(
        &self,
        filter: ScanFilter,
    ) -> BoxStream<'static, Result<Advertisement<C::Peripheral>>> {
        let central = self.central.clone();
        let gate = self.gate.clone();

        stream::once(async move {
            let slot = gate.lock_owned().await;
            debug!("Starting scan with filter {:?}", filter);

            central
                .scan(filter.clone(), ScanPermit::new(slot, filter.clone()))
                .filter(move |item| {
                    future::ready(match item {
                        Ok(advertisement) => filter.matches(advertisement),
                        Err(_) => true,
                    })
                })
                .scan(false, |failed, item| {
                    if *failed {
                        return future::ready(None);
                    }
                    if let Err(e) = &item {
                        warn!("Scan failed: {}", e);
                        *failed = true;
                    }
                    future::ready(Some(item))
                })
        })
        .flatten()
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{BATTERY_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID};
    use crate::error::Error;
    use crate::testing::{FakeCentral, FakePeripheral};
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const ANY: [Uuid; 0] = [];

    fn summary(address: &str, name: Option<&str>) -> PeripheralSummary {
        PeripheralSummary {
            address: address.into(),
            name: name.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_duplicate_advertisements_suppressed() {
        let central = FakeCentral::new();
        let aa = FakePeripheral::new("AA");
        let bb = FakePeripheral::new("BB");
        central.advertise(&aa, Some("Power Meter"), true, vec![BATTERY_SERVICE_UUID]);
        central.advertise(&aa, Some("Power Meter"), true, vec![BATTERY_SERVICE_UUID]);
        central.advertise(&bb, None, true, vec![BATTERY_SERVICE_UUID]);

        let scanner = PeripheralScanner::new(Arc::new(central));
        let mut scan = scanner.scan([BATTERY_SERVICE_UUID]);

        let mut found = Vec::new();
        for _ in 0..2 {
            found.push(scan.next().await.unwrap().unwrap());
        }

        assert_eq!(
            found,
            vec![summary("AA", Some("Power Meter")), summary("BB", None)]
        );
        assert!(scan.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_filter_rechecked() {
        let central = FakeCentral::new();
        let info_only = FakePeripheral::new("CC");
        let battery = FakePeripheral::new("DD");
        central.advertise(&info_only, None, true, vec![DEVICE_INFO_SERVICE_UUID]);
        central.advertise(&battery, None, true, vec![BATTERY_SERVICE_UUID]);

        let scanner = PeripheralScanner::new(Arc::new(central));
        let mut scan = scanner.scan([BATTERY_SERVICE_UUID]);

        assert_eq!(scan.next().await.unwrap().unwrap(), summary("DD", None));
        assert!(scan.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_empty_filter_matches_all() {
        let central = FakeCentral::new();
        central.advertise(&FakePeripheral::new("AA"), None, true, vec![]);
        central.advertise(&FakePeripheral::new("BB"), None, false, vec![BATTERY_SERVICE_UUID]);

        let scanner = PeripheralScanner::new(Arc::new(central));
        let found: Vec<_> = scanner
            .scan(ANY)
            .take(2)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(found, vec![summary("AA", None), summary("BB", None)]);
    }

    #[tokio::test]
    async fn test_unavailable_radio_terminates() {
        let central = FakeCentral::new();
        central.set_unavailable();

        let scanner = PeripheralScanner::new(Arc::new(central));
        let mut scan = scanner.scan([BATTERY_SERVICE_UUID]);

        assert!(matches!(
            scan.next().await,
            Some(Err(Error::HardwareUnavailable))
        ));
        assert!(scan.next().await.is_none());
    }

    #[tokio::test]
    async fn test_scan_is_lazy_and_stops_on_drop() {
        let central = FakeCentral::new();
        central.advertise(&FakePeripheral::new("AA"), None, true, vec![]);
        let scanner = PeripheralScanner::new(Arc::new(central.clone()));

        let mut scan = scanner.scan(ANY);
        assert_eq!(central.scan_calls(), 0);

        scan.next().await.unwrap().unwrap();
        assert_eq!(central.scan_calls(), 1);
        assert_eq!(central.active_scans(), 1);

        drop(scan);
        assert_eq!(central.active_scans(), 0);
    }

    #[tokio::test]
    async fn test_scan_restartable() {
        let central = FakeCentral::new();
        central.advertise(&FakePeripheral::new("AA"), None, true, vec![]);
        let scanner = PeripheralScanner::new(Arc::new(central.clone()));

        for _ in 0..2 {
            let mut scan = scanner.scan(ANY);
            assert_eq!(scan.next().await.unwrap().unwrap(), summary("AA", None));
        }
        assert_eq!(central.scan_calls(), 2);
    }

    #[tokio::test]
    async fn test_next_scan_waits_for_hardware_stop() {
        let central = FakeCentral::new();
        central.defer_stop();
        central.advertise(&FakePeripheral::new("AA"), None, true, vec![]);
        let scanner = PeripheralScanner::new(Arc::new(central.clone()));

        let mut first = scanner.scan(ANY);
        first.next().await.unwrap().unwrap();
        drop(first);

        let mut second = scanner.scan(ANY);
        assert_eq!(second.next().await.unwrap().unwrap(), summary("AA", None));

        assert_eq!(central.max_active_scans(), 1);
        assert_eq!(
            central.log(),
            vec!["scan started", "scan stopped", "scan started"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_scans_serialized() {
        let central = FakeCentral::new();
        central.advertise(&FakePeripheral::new("AA"), None, true, vec![]);
        let scanner = PeripheralScanner::new(Arc::new(central.clone()));

        let mut first = scanner.scan(ANY);
        first.next().await.unwrap().unwrap();

        let mut second = scanner.scan(ANY);
        assert!(second.next().now_or_never().is_none());
        assert_eq!(central.scan_calls(), 1);

        drop(first);
        assert_eq!(second.next().await.unwrap().unwrap(), summary("AA", None));
        assert_eq!(central.scan_calls(), 2);
        assert_eq!(central.active_scans(), 1);
    }

    proptest! {
        #[test]
        fn prop_each_address_emitted_once(addresses in proptest::collection::vec("[A-E]", 0..24)) {
            let central = FakeCentral::new();
            let mut expected = Vec::new();
            for address in &addresses {
                central.advertise(&FakePeripheral::new(address), None, true, vec![]);
                if !expected.contains(address) {
                    expected.push(address.clone());
                }
            }

            let scanner = PeripheralScanner::new(Arc::new(central));
            let emitted: Vec<String> = tokio_test::block_on(async {
                let mut scan = scanner.scan(ANY);
                let mut emitted = Vec::new();
                for _ in 0..expected.len() {
                    let summary = scan.next().await.unwrap().unwrap();
                    emitted.push(summary.address.as_str().to_string());
                }
                assert!(scan.next().now_or_never().is_none());
                emitted
            });

            prop_assert_eq!(emitted, expected);
        }
    }
}
