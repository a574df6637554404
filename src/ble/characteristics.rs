//! GATT characteristic handling.
//!
//! Provides one-shot reads and persistent notification streams on a
//! connected peripheral. Faults on one characteristic are logged and never
//! end the stream, so observers of sibling characteristics are unaffected.

use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::connection::PeripheralHandle;
use crate::ble::uuids::short_uuid;
use crate::ble::stack::{find_characteristic, GattService, RemoteCharacteristic, RemotePeripheral};
use crate::error::{Error, Result};
use crate::utils::to_hex;

/// The subscription of the latest discovery round.
struct ActiveSubscription<C> {
    characteristic: C,
    payloads: BoxStream<'static, Result<Vec<u8>>>,
}

enum DriverEvent<C> {
    Closed,
    Expired,
    Discovery(Option<Vec<GattService<C>>>),
    Payload(Option<Result<Vec<u8>>>),
}

/// Target of one observer call, for diagnostics.
#[derive(Clone, Copy)]
struct Target {
    service: Uuid,
    characteristic: Uuid,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (short_uuid(&self.service), short_uuid(&self.characteristic)) {
            (Some(service), Some(characteristic)) => {
                write!(f, "{:04X}:{:04X}", service, characteristic)
            }
            _ => write!(f, "{}:{}", self.service, self.characteristic),
        }
    }
}

type Launch<T> = Box<dyn FnOnce() -> (mpsc::Receiver<T>, JoinHandle<()>) + Send>;

enum StreamState<T> {
    Idle(Launch<T>),
    Running {
        values: mpsc::Receiver<T>,
        driver: JoinHandle<()>,
    },
    Closed,
}

/// Decoded notifications of one characteristic.
///
/// Observation starts on first poll. [`CharacteristicStream::close`] stops
/// it and waits for the unsubscribe; dropping the stream stops it in the
/// background.
pub struct CharacteristicStream<T> {
    state: StreamState<T>,
}

impl<T: Send + 'static> CharacteristicStream<T> {
    /// Stop observing, returning once the subscription has been stopped.
    pub async fn close(mut self) {
        if let StreamState::Running { values, driver } =
            std::mem::replace(&mut self.state, StreamState::Closed)
        {
            drop(values);
            if let Err(e) = driver.await {
                warn!("Observer task failed: {}", e);
            }
        }
    }
}

impl<T: Send + 'static> Stream for CharacteristicStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();

        if let StreamState::Idle(_) = this.state {
            if let StreamState::Idle(launch) = std::mem::replace(&mut this.state, StreamState::Closed) {
                let (values, driver) = launch();
                this.state = StreamState::Running { values, driver };
            }
        }

        match &mut this.state {
            StreamState::Running { values, .. } => values.poll_recv(cx),
            _ => Poll::Ready(None),
        }
    }
}

impl<T> fmt::Debug for CharacteristicStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            StreamState::Idle(_) => "idle",
            StreamState::Running { .. } => "running",
            StreamState::Closed => "closed",
        };
        f.debug_struct("CharacteristicStream")
            .field("state", &state)
            .finish()
    }
}

/// Persistent notification streams with re-discovery.
#[derive(Debug, Clone)]
pub struct CharacteristicObserver {
    /// Decoded values buffered per stream.
    buffer: usize,
}

impl CharacteristicObserver {
    /// Create an observer buffering up to `buffer` values per stream.
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }

    /// Observe notifications of `service`/`characteristic`, decoded with `decode`.
    ///
    /// Every time the service set is re-discovered, the previous subscription
    /// is stopped and the characteristic is resolved and subscribed again.
    /// Decode and subscription errors are logged and skipped. The stream ends
    /// when the handle is revoked or discovery ends.
    pub fn observe<P, T, F>(
        &self,
        handle: &PeripheralHandle<P>,
        service: Uuid,
        characteristic: Uuid,
        decode: F,
    ) -> CharacteristicStream<T>
    where
        P: RemotePeripheral,
        T: fmt::Debug + Send + 'static,
        F: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    {
        let handle = handle.clone();
        let buffer = self.buffer;
        let target = Target {
            service,
            characteristic,
        };

        CharacteristicStream {
            state: StreamState::Idle(Box::new(move || {
                let (tx, rx) = mpsc::channel(buffer);
                (rx, tokio::spawn(drive(handle, target, decode, tx)))
            })),
        }
    }
}

async fn drive<P, T, F>(handle: PeripheralHandle<P>, target: Target, decode: F, tx: mpsc::Sender<T>)
where
    P: RemotePeripheral,
    T: fmt::Debug + Send + 'static,
    F: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
{
    let mut rounds = handle.peripheral().services(vec![target.service]);
    let mut active: Option<ActiveSubscription<P::Characteristic>> = None;

    loop {
        let event = tokio::select! {
            biased;
            _ = tx.closed() => DriverEvent::Closed,
            _ = handle.expired() => DriverEvent::Expired,
            round = rounds.next() => DriverEvent::Discovery(round),
            payload = next_payload(&mut active) => DriverEvent::Payload(payload),
        };

        match event {
            DriverEvent::Closed => {
                trace!("Observer of {} dropped", target);
                break;
            }
            DriverEvent::Expired => {
                debug!("Handle for {} expired", target);
                break;
            }
            DriverEvent::Discovery(None) => {
                debug!("Service discovery for {} ended", target);
                break;
            }
            DriverEvent::Discovery(Some(round)) => {
                debug!("Services changed: {} found for {}", round.len(), target);
                stop(active.take(), target).await;
                active = start(&round, target).await;
            }
            DriverEvent::Payload(Some(Ok(payload))) => match decode(&payload) {
                Ok(value) => {
                    trace!("Data changed: 0x{} -> {:?}", to_hex(&payload), value);
                    if tx.send(value).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Characteristic {} error: {}", target, e),
            },
            DriverEvent::Payload(Some(Err(e))) => {
                warn!("Characteristic {} error: {}", target, e);
            }
            DriverEvent::Payload(None) => {
                debug!("Notifications for {} ended", target);
                stop(active.take(), target).await;
            }
        }
    }

    stop(active.take(), target).await;
}

async fn next_payload<C>(active: &mut Option<ActiveSubscription<C>>) -> Option<Result<Vec<u8>>> {
    match active {
        Some(subscription) => subscription.payloads.next().await,
        None => future::pending().await,
    }
}

async fn start<C: RemoteCharacteristic>(
    round: &[GattService<C>],
    target: Target,
) -> Option<ActiveSubscription<C>> {
    let Some(characteristic) = find_characteristic(round, &target.service, &target.characteristic)
    else {
        warn!(
            "{}",
            Error::CharacteristicNotFound {
                service: target.service,
                characteristic: target.characteristic,
            }
        );
        return None;
    };

    match characteristic.subscribe().await {
        Ok(payloads) => {
            debug!("Observing {}", target);
            Some(ActiveSubscription {
                characteristic,
                payloads,
            })
        }
        Err(e) => {
            warn!("Characteristic {} error: {}", target, e);
            None
        }
    }
}

async fn stop<C: RemoteCharacteristic>(active: Option<ActiveSubscription<C>>, target: Target) {
    let Some(ActiveSubscription {
        characteristic,
        payloads,
    }) = active
    else {
        return;
    };

    drop(payloads);
    if let Err(e) = characteristic.unsubscribe().await {
        warn!("Failed to stop observing {}: {}", target, e);
    }
    debug!("Stopped observing {}", target);
}

/// One-shot characteristic reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharacteristicReader;

impl CharacteristicReader {
    /// Read `service`/`characteristic` once and decode it.
    ///
    /// Waits until discovery reports `service`, then issues exactly one read.
    /// Returns `Ok(None)` when the service or characteristic cannot be
    /// located, including when discovery ends or the handle is revoked while
    /// waiting.
    pub async fn read<P, T, F>(
        &self,
        handle: &PeripheralHandle<P>,
        service: Uuid,
        characteristic: Uuid,
        decode: F,
    ) -> Result<Option<T>>
    where
        P: RemotePeripheral,
        F: FnOnce(&[u8]) -> Result<T>,
    {
        if !handle.is_valid() {
            return Err(Error::HandleExpired);
        }

        let mut rounds = handle.peripheral().services(vec![service]);
        let discovered = tokio::select! {
            biased;
            _ = handle.expired() => None,
            round = async {
                while let Some(round) = rounds.next().await {
                    if round.iter().any(|s| s.uuid == service) {
                        return Some(round);
                    }
                }
                None
            } => round,
        };

        let Some(round) = discovered else {
            debug!("Service {} not discovered", service);
            return Ok(None);
        };

        let Some(found) = find_characteristic(&round, &service, &characteristic) else {
            warn!(
                "{}",
                Error::CharacteristicNotFound {
                    service,
                    characteristic
                }
            );
            return Ok(None);
        };

        let payload = found.read().await?;
        trace!(
            "Read 0x{} from {}:{}",
            to_hex(&payload),
            service,
            characteristic
        );

        decode(&payload).map(Some)
    }
}
