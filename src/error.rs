//! Error types for the peripheral-link crate.

use thiserror::Error;
use uuid::Uuid;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The radio is missing, powered off, or no adapter could be opened.
    #[error("Bluetooth hardware unavailable")]
    HardwareUnavailable,

    /// The stack rejected or failed the connection request.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The handle belongs to a connection that is no longer active.
    #[error("Peripheral handle used after disconnection")]
    HandleExpired,

    /// Characteristic not found in the discovered services.
    #[error("Characteristic not found: {service}:{characteristic}")]
    CharacteristicNotFound {
        /// The service that was searched.
        service: Uuid,
        /// The characteristic that was not found.
        characteristic: Uuid,
    },

    /// A notification subscription failed or delivered an error.
    #[error("Subscription error: {reason}")]
    Subscription {
        /// Description of the failure.
        reason: String,
    },

    /// A payload could not be decoded into the requested value.
    #[error("Decode error: {context}")]
    Decode {
        /// Description of what was invalid about the payload.
        context: String,
    },

    /// The host event source refused the listener.
    #[error("Listener registration failed: {reason}")]
    ListenerRegistration {
        /// Description of why registration failed.
        reason: String,
    },

    /// The host event source dropped the listener before the awaited event.
    #[error("Event listener closed")]
    ListenerClosed,
}

impl Error {
    /// Build a [`Error::Decode`] from anything printable.
    pub fn decode(context: impl Into<String>) -> Self {
        Self::Decode {
            context: context.into(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
