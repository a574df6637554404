//! BLE connection management.
//!
//! A connection session locates one peripheral by address, connects to it and
//! follows its connection state. Whatever way the session ends, a connection
//! that was requested is released exactly once.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::ble::scanner::PeripheralScanner;
use crate::ble::stack::{Central, PeripheralAddress, RemotePeripheral};
use crate::error::{Error, Result};

/// Connection state for a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the peripheral.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the peripheral.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Access to a connected peripheral.
///
/// A handle is only valid while the connection that produced it stays in
/// [`ConnectionState::Connected`]. Once revoked it never becomes valid again;
/// a later reconnection yields a new handle.
#[derive(Clone)]
pub struct PeripheralHandle<P> {
    peripheral: P,
    alive: watch::Receiver<bool>,
}

impl<P: RemotePeripheral> PeripheralHandle<P> {
    pub(crate) fn new(peripheral: P, alive: watch::Receiver<bool>) -> Self {
        Self { peripheral, alive }
    }

    /// The underlying stack peripheral.
    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    /// Address of the peripheral.
    pub fn address(&self) -> PeripheralAddress {
        self.peripheral.address()
    }

    /// Whether the connection behind this handle is still active.
    pub fn is_valid(&self) -> bool {
        self.alive.has_changed().is_ok() && *self.alive.borrow()
    }

    /// Resolves once the handle has been revoked.
    pub(crate) async fn expired(&self) {
        let mut alive = self.alive.clone();
        loop {
            if !*alive.borrow_and_update() {
                return;
            }
            if alive.changed().await.is_err() {
                return;
            }
        }
    }
}

impl<P: RemotePeripheral> fmt::Debug for PeripheralHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralHandle")
            .field("peripheral", &self.peripheral)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Sequence of optional handles produced by [`ConnectionManager::connect`].
///
/// Yields `Some` while the peripheral is connected and `None` otherwise.
/// Call [`ConnectionSession::close`] to end the session and wait for the
/// disconnect. Dropping the session instead disconnects in the background,
/// which needs the runtime to keep running.
pub struct ConnectionSession<P> {
    updates: BoxStream<'static, Result<Option<PeripheralHandle<P>>>>,
    teardown: Teardown,
}

impl<P: RemotePeripheral> ConnectionSession<P> {
    /// End the session, returning once the peripheral has been disconnected.
    ///
    /// Handles issued by this session are revoked before the disconnect.
    pub async fn close(mut self) {
        drop(std::mem::replace(&mut self.updates, stream::empty().boxed()));
        self.teardown.release().await;
    }
}

impl<P> Stream for ConnectionSession<P> {
    type Item = Result<Option<PeripheralHandle<P>>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_next_unpin(cx)
    }
}

impl<P> Drop for ConnectionSession<P> {
    fn drop(&mut self) {
        self.teardown.release_in_background();
    }
}

impl<P> fmt::Debug for ConnectionSession<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession").finish_non_exhaustive()
    }
}

/// Issues handles for one connection and revokes them.
#[derive(Default)]
struct Liveness {
    tx: Option<watch::Sender<bool>>,
}

impl Liveness {
    fn issue(&mut self) -> watch::Receiver<bool> {
        match &self.tx {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(true);
                self.tx = Some(tx);
                rx
            }
        }
    }

    fn revoke(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(false);
        }
    }
}

/// One slot per address; a session holds its slot from scan to disconnect.
#[derive(Clone, Default)]
struct ConnectionRegistry {
    slots: Arc<Mutex<HashMap<PeripheralAddress, Arc<AsyncMutex<()>>>>>,
}

impl ConnectionRegistry {
    async fn acquire(&self, address: &PeripheralAddress) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock();
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(address.clone()).or_default().clone()
        };

        if slot.try_lock().is_err() {
            debug!("Waiting for previous session with {} to end", address);
        }

        slot.lock_owned().await
    }
}

/// Disconnect owed by a session, run at most once.
///
/// Armed with the disconnect work before the connect request is issued.
/// Whoever takes the work first runs it: the session on normal completion or
/// `close`, or a background task when the session is dropped.
#[derive(Clone, Default)]
struct Teardown {
    pending: Arc<Mutex<Option<BoxFuture<'static, ()>>>>,
}

impl Teardown {
    fn arm<C: Central>(&self, central: Arc<C>, peripheral: C::Peripheral, slot: OwnedMutexGuard<()>) {
        let work = async move {
            disconnect(central.as_ref(), &peripheral).await;
            drop(slot);
        };
        *self.pending.lock() = Some(work.boxed());
    }

    /// The connect request failed; nothing to release on the radio.
    fn disarm(&self) {
        self.pending.lock().take();
    }

    /// Run the disconnect and wait for it.
    ///
    /// The work runs as its own task, so it completes even if the caller is
    /// cancelled while waiting.
    async fn release(&self) {
        let work = self.pending.lock().take();
        if let Some(work) = work {
            if let Err(e) = tokio::spawn(work).await {
                error!("Disconnect task failed: {}", e);
            }
        }
    }

    fn release_in_background(&self) {
        let Some(work) = self.pending.lock().take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(work);
            }
            Err(_) => error!("No runtime available to disconnect; connection leaked"),
        }
    }
}

async fn disconnect<C: Central>(central: &C, peripheral: &C::Peripheral) {
    let address = peripheral.address();
    info!("Disconnecting from {}", address);

    match central.disconnect(peripheral).await {
        Ok(()) => info!("Disconnected from {}", address),
        Err(e) => warn!("Failed to disconnect from {}: {}", address, e),
    }
}

/// Find the first connectable advertisement for `address`.
///
/// The scan stops as soon as this returns.
async fn locate<C: Central>(
    scanner: &PeripheralScanner<C>,
    address: &PeripheralAddress,
) -> Result<Option<C::Peripheral>> {
    let mut advertisements = scanner.locate(address.clone());

    while let Some(advertisement) = advertisements.next().await {
        let advertisement = advertisement?;
        if advertisement.connectable {
            return Ok(Some(advertisement.peripheral));
        }
        trace!("Ignoring non-connectable advertisement from {}", address);
    }

    Ok(None)
}

enum Step<C: Central> {
    Locate {
        central: Arc<C>,
        scanner: PeripheralScanner<C>,
        registry: ConnectionRegistry,
        address: PeripheralAddress,
        teardown: Teardown,
    },
    Running {
        peripheral: C::Peripheral,
        states: BoxStream<'static, ConnectionState>,
        liveness: Liveness,
        teardown: Teardown,
    },
    Done,
}

impl<C: Central> Step<C> {
    async fn advance(self) -> Option<(Result<Option<PeripheralHandle<C::Peripheral>>>, Self)> {
        let mut step = self;

        loop {
            match step {
                Step::Locate {
                    central,
                    scanner,
                    registry,
                    address,
                    teardown,
                } => {
                    let slot = registry.acquire(&address).await;

                    let peripheral = match locate(&scanner, &address).await {
                        Ok(Some(peripheral)) => peripheral,
                        Ok(None) => {
                            debug!("Scan for {} ended without a connectable match", address);
                            return None;
                        }
                        Err(e) => return Some((Err(e), Step::Done)),
                    };

                    // Created before connecting; every backend starts the
                    // stream with the state current at its first poll.
                    let states = peripheral.connection_state();

                    info!("Connecting to {}", address);
                    teardown.arm(central.clone(), peripheral.clone(), slot);

                    if let Err(e) = central.connect(&peripheral).await {
                        warn!("Connecting to {} failed: {}", address, e);
                        teardown.disarm();
                        let e = match e {
                            Error::ConnectFailed { .. } => e,
                            other => Error::ConnectFailed {
                                reason: other.to_string(),
                            },
                        };
                        return Some((Err(e), Step::Done));
                    }
                    info!("Connect request to {} accepted", address);

                    step = Step::Running {
                        peripheral,
                        states,
                        liveness: Liveness::default(),
                        teardown,
                    };
                }
                Step::Running {
                    peripheral,
                    mut states,
                    mut liveness,
                    teardown,
                } => {
                    return match states.next().await {
                        Some(state) => {
                            debug!("State of {}: {}", peripheral.address(), state);

                            let handle = if state.is_connected() {
                                Some(PeripheralHandle::new(peripheral.clone(), liveness.issue()))
                            } else {
                                liveness.revoke();
                                None
                            };

                            Some((
                                Ok(handle),
                                Step::Running {
                                    peripheral,
                                    states,
                                    liveness,
                                    teardown,
                                },
                            ))
                        }
                        None => {
                            debug!("State updates for {} ended", peripheral.address());
                            liveness.revoke();
                            teardown.release().await;
                            None
                        }
                    };
                }
                Step::Done => return None,
            }
        }
    }
}

/// Opens connection sessions on a central.
///
/// Sessions for the same address are serialized: a new session does not
/// start scanning until the previous one has disconnected.
pub struct ConnectionManager<C: Central> {
    central: Arc<C>,
    scanner: PeripheralScanner<C>,
    registry: ConnectionRegistry,
}

impl<C: Central> ConnectionManager<C> {
    /// Create a connection manager sharing `scanner`'s scan gate.
    pub fn new(central: Arc<C>, scanner: PeripheralScanner<C>) -> Self {
        Self {
            central,
            scanner,
            registry: ConnectionRegistry::default(),
        }
    }

    /// Open a session with the peripheral at `address`.
    ///
    /// Nothing happens until the session is polled. There is no timeout on
    /// locating the peripheral; bound it externally if needed.
    pub fn connect(&self, address: impl Into<PeripheralAddress>) -> ConnectionSession<C::Peripheral> {
        let teardown = Teardown::default();
        let start = Step::Locate {
            central: self.central.clone(),
            scanner: self.scanner.clone(),
            registry: self.registry.clone(),
            address: address.into(),
            teardown: teardown.clone(),
        };

        ConnectionSession {
            updates: stream::unfold(start, Step::advance).boxed(),
            teardown,
        }
    }
}
