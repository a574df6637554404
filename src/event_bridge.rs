//! Host event bridge.
//!
//! Adapts a push-style listener API (`add_consumer` / `remove_consumer`)
//! into streams. A listener is registered on first poll and removed exactly
//! once when the stream is closed or dropped.

use futures::stream::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::config::BleConfig;
use crate::error::{Error, Result};

/// Callback handed to the host for every inbound event.
pub type EventCallback<E> = Box<dyn Fn(E) + Send + Sync>;

/// Identifier the host assigns to a registered listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(String);

impl ListenerId {
    /// Wrap a host listener id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ListenerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The host's push API.
pub trait EventSource: Send + Sync + 'static {
    /// Describes which events a consumer wants.
    type Spec: fmt::Debug + Send + 'static;
    /// Events delivered to consumers.
    type Event: Send + 'static;

    /// Register `callback` for events matching `spec`.
    fn add_consumer(&self, spec: Self::Spec, callback: EventCallback<Self::Event>) -> Result<ListenerId>;

    /// Register `callback` for host connection changes.
    fn register_connection_listener(&self, callback: EventCallback<bool>) -> Result<ListenerId>;

    /// Remove a listener.
    fn remove_consumer(&self, id: ListenerId);
}

type Register<E> = Box<dyn FnOnce(EventCallback<E>) -> Result<ListenerId> + Send>;
type Deregister = Arc<dyn Fn(ListenerId) + Send + Sync>;

/// A registered listener, removed on drop.
struct Registration {
    id: Option<ListenerId>,
    deregister: Deregister,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            debug!("Removing listener {}", id);
            (self.deregister)(id);
        }
    }
}

enum State<E> {
    Idle {
        register: Register<E>,
        deregister: Deregister,
    },
    Active {
        events: mpsc::Receiver<E>,
        _registration: Registration,
    },
    Finished,
}

/// Stream of host events for one listener.
pub struct EventStream<E> {
    state: State<E>,
    buffer: usize,
}

impl<E: Send + 'static> EventStream<E> {
    fn new(register: Register<E>, deregister: Deregister, buffer: usize) -> Self {
        Self {
            state: State::Idle {
                register,
                deregister,
            },
            buffer,
        }
    }

    /// Remove the listener now. Later calls are no-ops.
    pub fn close(&mut self) {
        self.state = State::Finished;
    }

    /// Whether the listener is currently registered.
    pub fn is_registered(&self) -> bool {
        matches!(self.state, State::Active { .. })
    }
}

impl<E: Send + 'static> Stream for EventStream<E> {
    type Item = Result<E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                State::Idle { .. } => {
                    let State::Idle {
                        register,
                        deregister,
                    } = std::mem::replace(&mut this.state, State::Finished)
                    else {
                        unreachable!()
                    };

                    let (tx, rx) = mpsc::channel(this.buffer);
                    match register(forwarder(tx)) {
                        Ok(id) => {
                            debug!("Registered listener {}", id);
                            this.state = State::Active {
                                events: rx,
                                _registration: Registration {
                                    id: Some(id),
                                    deregister,
                                },
                            };
                        }
                        Err(e) => {
                            warn!("Listener registration failed: {}", e);
                            let e = match e {
                                Error::ListenerRegistration { .. } => e,
                                other => Error::ListenerRegistration {
                                    reason: other.to_string(),
                                },
                            };
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }
                State::Active { events, .. } => {
                    return events.poll_recv(cx).map(|event| event.map(Ok));
                }
                State::Finished => return Poll::Ready(None),
            }
        }
    }
}

/// Build the host callback feeding `tx`.
///
/// A full buffer blocks the host thread until there is room, so no event is
/// lost. On a multi-thread runtime worker the wait goes through
/// `block_in_place`. A current-thread runtime cannot block at all; there a
/// full buffer drops the event with a warning.
fn forwarder<E: Send + 'static>(tx: mpsc::Sender<E>) -> EventCallback<E> {
    Box::new(move |event| match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            let delivered = match tokio::runtime::Handle::try_current() {
                Err(_) => tx.blocking_send(event).is_ok(),
                Ok(runtime) if runtime.runtime_flavor() == RuntimeFlavor::MultiThread => {
                    tokio::task::block_in_place(|| tx.blocking_send(event).is_ok())
                }
                Ok(_) => {
                    warn!("Event buffer full on current-thread runtime; event dropped");
                    return;
                }
            };
            if !delivered {
                trace!("Listener closed; event discarded");
            }
        }
        Err(TrySendError::Closed(_)) => trace!("Listener closed; event discarded"),
    })
}

/// Turns an [`EventSource`] into streams.
pub struct EventBridge<S: EventSource> {
    source: Arc<S>,
    buffer: usize,
}

impl<S: EventSource> Clone for EventBridge<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            buffer: self.buffer,
        }
    }
}

impl<S: EventSource> EventBridge<S> {
    /// Create a bridge buffering up to `buffer` events per stream.
    pub fn new(source: Arc<S>, buffer: usize) -> Self {
        Self {
            source,
            buffer: buffer.max(1),
        }
    }

    /// Create a bridge sized by [`BleConfig::event_buffer`].
    pub fn with_config(source: Arc<S>, config: &BleConfig) -> Self {
        Self::new(source, config.event_buffer)
    }

    /// Stream events matching `spec`.
    ///
    /// The listener is registered on first poll. A failed registration yields
    /// one [`Error::ListenerRegistration`] and ends the stream.
    pub fn stream(&self, spec: S::Spec) -> EventStream<S::Event> {
        let source = self.source.clone();
        trace!("Preparing listener for {:?}", spec);

        EventStream::new(
            Box::new(move |callback| source.add_consumer(spec, callback)),
            self.deregister(),
            self.buffer,
        )
    }

    /// Stream host connection changes.
    pub fn connection_events(&self) -> EventStream<bool> {
        let source = self.source.clone();

        EventStream::new(
            Box::new(move |callback| source.register_connection_listener(callback)),
            self.deregister(),
            self.buffer,
        )
    }

    /// Wait until the host reports it is connected.
    ///
    /// The listener only lives for the duration of the call.
    pub async fn wait_for_connection(&self) -> Result<()> {
        let mut events = self.connection_events();

        while let Some(connected) = events.next().await {
            if connected? {
                events.close();
                debug!("Host connection established");
                return Ok(());
            }
        }

        Err(Error::ListenerClosed)
    }

    fn deregister(&self) -> Deregister {
        let source = self.source.clone();
        Arc::new(move |id| source.remove_consumer(id))
    }
}
