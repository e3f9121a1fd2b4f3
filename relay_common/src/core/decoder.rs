//! # Frame Decoder Seam
//!
//! The relay never interprets wire bytes itself. A market module supplies a
//! [`FrameDecoder`] that turns one binary frame into a structured message, and
//! the message type tells the hub whether it carries feed data through
//! [`FeedSnapshot`].

use serde::Serialize;

use crate::core::error::DecodeError;

/// A decoded message the hub can cache and fan out.
pub trait FeedSnapshot: Serialize + Send + Sync + 'static {
    /// `true` when the message carries a non-empty feeds field. Only such
    /// messages replace the cached snapshot.
    fn has_feeds(&self) -> bool;
}

/// Turns raw upstream frames into structured messages.
///
/// Implementations must be pure: no I/O and no shared mutable state, so the same
/// decoder can be used from several tasks at once.
pub trait FrameDecoder: Send + Sync + 'static {
    /// The structured message produced for each frame.
    type Message: FeedSnapshot;

    /// Decodes one frame, failing with [`DecodeError`] when it does not match
    /// the schema.
    fn decode(&self, frame: &[u8]) -> Result<Self::Message, DecodeError>;
}
