//! # Core Relay Engine
//!
//! The distribution and resilience engine of the relay. Everything that has
//! real concurrency, failure isolation or ordering concerns lives here; the
//! market-specific schema and the transports plug into it from the outside.
//!
//! ## Core Components:
//!
//! - **`decoder`**: the `FrameDecoder` seam. A pure function from a binary frame
//!   to a structured message, supplied by a market module.
//!
//! - **`state_cache`**: the single-slot cache of the last message that carried
//!   feed data, used to bootstrap late joiners.
//!
//! - **`stats`**: lock-free monotonic counters exposed for operational queries.
//!
//! - **`hub`**: the fan-out `BroadcastHub`. It owns the subscriber table, the
//!   cache and the counters, delivers each upstream message to every subscriber
//!   and evicts the ones whose delivery fails.
//!
//! - **`reconnect`**: the bounded exponential backoff state machine shared by the
//!   upstream supervisor and the downstream client.
//!
//! - **`error`**: the error taxonomy shared by the components above.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Error types shared by the relay components.
pub mod error;
/// The frame decoder seam and the snapshot trait for decoded messages.
pub mod decoder;
/// Single-slot cache of the latest message carrying feeds.
pub mod state_cache;
/// Monotonic relay counters.
pub mod stats;
/// The fan-out hub serving every downstream subscriber.
pub mod hub;
/// Bounded exponential backoff state machine.
pub mod reconnect;

// --- Public API Re-exports ---
pub use decoder::{FeedSnapshot, FrameDecoder};
pub use error::{ConnectionError, DecodeError, DeliveryError, RelayError};
pub use hub::{BroadcastHub, HubConfig, StatusNotice, SubscriberId, UpstreamEvent, UpstreamStatus};
pub use reconnect::{
    ConnectionState, DisconnectHandle, ReconnectConfig, ReconnectDecision, ReconnectOutcome,
    ReconnectPolicy,
};
pub use state_cache::StateCache;
pub use stats::{StatsCollector, StatsSnapshot};
