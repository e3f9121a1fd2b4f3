//! Error taxonomy of the relay.
//!
//! Decode and delivery errors are always handled by the component that detects
//! them. Only connection level failures travel further, and then only as
//! lifecycle notifications.

use thiserror::Error;

/// A frame that does not conform to the feed schema. Recoverable: the frame is
/// skipped and the session continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The frame carried no bytes at all.
    #[error("empty frame")]
    Empty,
    /// The bytes could not be parsed (truncated or corrupted).
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// An enumeration field carried a tag the schema does not define.
    #[error("unknown {field} tag {tag}")]
    UnknownTag {
        /// Name of the offending field.
        field: &'static str,
        /// The raw tag value found on the wire.
        tag: i32,
    },
}

/// A transport level failure on connect or while receiving.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The handshake with the remote endpoint failed.
    #[error("handshake with {endpoint} failed: {reason}")]
    Handshake {
        /// The endpoint that was dialled.
        endpoint: String,
        /// Transport error text.
        reason: String,
    },
    /// The subscription request could not be written after connecting.
    #[error("subscription request failed: {0}")]
    Subscribe(String),
    /// The stream failed while receiving.
    #[error("transport error: {0}")]
    Transport(String),
    /// No frame arrived within the idle window.
    #[error("no data received for {0}s")]
    Idle(u64),
}

/// A specific subscriber rejected a write. Recoverable by evicting that
/// subscriber only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The subscriber's queue is gone (its connection closed).
    #[error("subscriber {0} is closed")]
    Closed(u64),
    /// The subscriber did not accept the payload within the send timeout.
    #[error("subscriber {0} timed out")]
    TimedOut(u64),
}

/// Errors surfaced by the relay to its host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// See [`DecodeError`].
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// See [`ConnectionError`].
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// See [`DeliveryError`].
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    /// The reconnect policy used up every attempt. Terminal for that role.
    #[error("gave up after {attempts} reconnection attempts")]
    ExhaustedRetries {
        /// How many attempts were made.
        attempts: u32,
    },
}
