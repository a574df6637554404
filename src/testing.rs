//! In-memory BLE stack used by the unit tests.
//!
//! Every call the core makes into the stack is counted so tests can assert
//! on connect/disconnect and subscribe/unsubscribe balance.

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::ble::stack::{
    Advertisement, Central, GattService, PeripheralAddress, RemoteCharacteristic,
    RemotePeripheral, ScanFilter, ScanPermit,
};
use crate::error::{Error, Result};

/// Install a test subscriber once; honours `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let spawned tasks run until they block.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Multi-subscriber feed, optionally replaying the latest value to new
/// subscribers.
struct Feed<T> {
    latest: Option<T>,
    replay: bool,
    closed: bool,
    subscribers: Vec<UnboundedSender<T>>,
}

impl<T: Clone + Send + 'static> Feed<T> {
    fn new(replay: bool) -> Self {
        Self {
            latest: None,
            replay,
            closed: false,
            subscribers: Vec::new(),
        }
    }

    fn subscribe(&mut self) -> BoxStream<'static, T> {
        let (tx, rx) = unbounded();
        if self.replay {
            if let Some(value) = &self.latest {
                let _ = tx.unbounded_send(value.clone());
            }
        }
        if !self.closed {
            self.subscribers.push(tx);
        }
        rx.boxed()
    }

    fn push(&mut self, value: T) {
        self.subscribers
            .retain(|tx| tx.unbounded_send(value.clone()).is_ok());
        self.latest = Some(value);
    }

    fn close(&mut self) {
        self.closed = true;
        self.subscribers.clear();
    }
}

#[derive(Default)]
struct CentralState {
    advertisements: Vec<Advertisement<FakePeripheral>>,
    unavailable: bool,
    reject_connect: bool,
    stall_connect: bool,
    defer_stop: bool,
    scan_calls: usize,
    active_scans: usize,
    max_active_scans: usize,
    connect_calls: usize,
    disconnect_calls: usize,
    log: Vec<String>,
}

/// Fake radio. Scans replay the scripted advertisements and then stay open.
#[derive(Clone, Default)]
pub(crate) struct FakeCentral {
    state: Arc<Mutex<CentralState>>,
}

/// A running fake hardware scan; dropping it stops the scan.
struct ActiveScan(Arc<Mutex<CentralState>>, ScanPermit);

impl Drop for ActiveScan {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.active_scans -= 1;
        state.log.push("scan stopped".to_string());
    }
}

impl FakeCentral {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Script an advertisement for every future scan.
    pub(crate) fn advertise(
        &self,
        peripheral: &FakePeripheral,
        name: Option<&str>,
        connectable: bool,
        services: Vec<Uuid>,
    ) {
        self.state.lock().advertisements.push(Advertisement {
            peripheral: peripheral.clone(),
            address: peripheral.address(),
            name: name.map(str::to_string),
            connectable,
            services,
        });
    }

    pub(crate) fn set_unavailable(&self) {
        self.state.lock().unavailable = true;
    }

    pub(crate) fn reject_connect(&self) {
        self.state.lock().reject_connect = true;
    }

    /// Make connect requests hang forever.
    pub(crate) fn stall_connect(&self) {
        self.state.lock().stall_connect = true;
    }

    /// Stop scans from a separate task, after the consumer has gone away.
    pub(crate) fn defer_stop(&self) {
        self.state.lock().defer_stop = true;
    }

    pub(crate) fn scan_calls(&self) -> usize {
        self.state.lock().scan_calls
    }

    pub(crate) fn active_scans(&self) -> usize {
        self.state.lock().active_scans
    }

    pub(crate) fn max_active_scans(&self) -> usize {
        self.state.lock().max_active_scans
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }
}

#[async_trait]
impl Central for FakeCentral {
    type Peripheral = FakePeripheral;

    fn scan(
        &self,
        _filter: ScanFilter,
        permit: ScanPermit,
    ) -> BoxStream<'static, Result<Advertisement<FakePeripheral>>> {
        let mut state = self.state.lock();
        state.scan_calls += 1;

        if state.unavailable {
            return stream::once(future::ready(Err(Error::HardwareUnavailable))).boxed();
        }

        state.active_scans += 1;
        state.max_active_scans = state.max_active_scans.max(state.active_scans);
        state.log.push("scan started".to_string());

        let guard = ActiveScan(self.state.clone(), permit);
        let items: Vec<_> = state.advertisements.iter().cloned().map(Ok).collect();

        if state.defer_stop {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            for item in items {
                let _ = tx.send(item);
            }
            tokio::spawn(async move {
                tx.closed().await;
                // The stop request itself takes a round trip.
                tokio::task::yield_now().await;
                drop(guard);
            });
            return stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed();
        }

        stream::iter(items)
            .chain(stream::pending())
            .map(move |item| {
                let _active = &guard;
                item
            })
            .boxed()
    }

    async fn connect(&self, peripheral: &FakePeripheral) -> Result<()> {
        let (reject, stall) = {
            let mut state = self.state.lock();
            state.connect_calls += 1;
            state.log.push(format!("connect {}", peripheral.address()));
            (state.reject_connect, state.stall_connect)
        };

        if stall {
            future::pending::<()>().await;
        }

        if reject {
            Err(Error::ConnectFailed {
                reason: "rejected by peripheral".to_string(),
            })
        } else {
            Ok(())
        }
    }

    async fn disconnect(&self, peripheral: &FakePeripheral) -> Result<()> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        state.log.push(format!("disconnect {}", peripheral.address()));
        Ok(())
    }
}

struct PeripheralState {
    states: Feed<ConnectionState>,
    services: Feed<Vec<GattService<FakeCharacteristic>>>,
}

/// Fake peripheral driven by the test through `push_*`.
#[derive(Clone)]
pub(crate) struct FakePeripheral {
    address: PeripheralAddress,
    inner: Arc<Mutex<PeripheralState>>,
}

impl fmt::Debug for FakePeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FakePeripheral").field(&self.address).finish()
    }
}

impl FakePeripheral {
    pub(crate) fn new(address: &str) -> Self {
        Self {
            address: address.into(),
            inner: Arc::new(Mutex::new(PeripheralState {
                states: Feed::new(true),
                services: Feed::new(true),
            })),
        }
    }

    pub(crate) fn push_state(&self, state: ConnectionState) {
        self.inner.lock().states.push(state);
    }

    pub(crate) fn close_states(&self) {
        self.inner.lock().states.close();
    }

    pub(crate) fn push_services(&self, services: Vec<GattService<FakeCharacteristic>>) {
        self.inner.lock().services.push(services);
    }

    pub(crate) fn close_services(&self) {
        self.inner.lock().services.close();
    }
}

impl RemotePeripheral for FakePeripheral {
    type Characteristic = FakeCharacteristic;

    fn address(&self) -> PeripheralAddress {
        self.address.clone()
    }

    fn connection_state(&self) -> BoxStream<'static, ConnectionState> {
        self.inner.lock().states.subscribe()
    }

    fn services(&self, filter: Vec<Uuid>) -> BoxStream<'static, Vec<GattService<FakeCharacteristic>>> {
        self.inner
            .lock()
            .services
            .subscribe()
            .map(move |round| {
                round
                    .into_iter()
                    .filter(|s| filter.is_empty() || filter.contains(&s.uuid))
                    .collect()
            })
            .boxed()
    }
}

struct CharacteristicState {
    value: Vec<u8>,
    fail_subscribe: bool,
    read_calls: usize,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
    live: usize,
    max_live: usize,
    payloads: Feed<std::result::Result<Vec<u8>, String>>,
}

/// Fake characteristic with a readable value and a notification feed.
#[derive(Clone)]
pub(crate) struct FakeCharacteristic {
    uuid: Uuid,
    inner: Arc<Mutex<CharacteristicState>>,
}

impl fmt::Debug for FakeCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FakeCharacteristic").field(&self.uuid).finish()
    }
}

impl FakeCharacteristic {
    pub(crate) fn new(uuid: Uuid, value: &[u8]) -> Self {
        Self {
            uuid,
            inner: Arc::new(Mutex::new(CharacteristicState {
                value: value.to_vec(),
                fail_subscribe: false,
                read_calls: 0,
                subscribe_calls: 0,
                unsubscribe_calls: 0,
                live: 0,
                max_live: 0,
                payloads: Feed::new(false),
            })),
        }
    }

    pub(crate) fn notify(&self, payload: &[u8]) {
        self.inner.lock().payloads.push(Ok(payload.to_vec()));
    }

    pub(crate) fn notify_error(&self, reason: &str) {
        self.inner.lock().payloads.push(Err(reason.to_string()));
    }

    pub(crate) fn fail_subscribe(&self) {
        self.inner.lock().fail_subscribe = true;
    }

    pub(crate) fn read_calls(&self) -> usize {
        self.inner.lock().read_calls
    }

    pub(crate) fn subscribe_calls(&self) -> usize {
        self.inner.lock().subscribe_calls
    }

    pub(crate) fn unsubscribe_calls(&self) -> usize {
        self.inner.lock().unsubscribe_calls
    }

    pub(crate) fn live_subscriptions(&self) -> usize {
        self.inner.lock().live
    }

    pub(crate) fn max_live_subscriptions(&self) -> usize {
        self.inner.lock().max_live
    }
}

#[async_trait]
impl RemoteCharacteristic for FakeCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        let mut state = self.inner.lock();
        state.subscribe_calls += 1;

        if state.fail_subscribe {
            return Err(Error::Subscription {
                reason: "notifications not permitted".to_string(),
            });
        }

        state.live += 1;
        state.max_live = state.max_live.max(state.live);

        Ok(state
            .payloads
            .subscribe()
            .map(|payload| payload.map_err(|reason| Error::Subscription { reason }))
            .boxed())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.unsubscribe_calls += 1;
        state.live = state.live.saturating_sub(1);
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let mut state = self.inner.lock();
        state.read_calls += 1;
        Ok(state.value.clone())
    }
}

/// Build a discovered service.
pub(crate) fn service(uuid: Uuid, characteristics: &[&FakeCharacteristic]) -> GattService<FakeCharacteristic> {
    GattService {
        uuid,
        characteristics: characteristics.iter().map(|c| (*c).clone()).collect(),
    }
}
