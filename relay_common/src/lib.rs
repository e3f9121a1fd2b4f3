//! # relay_common
//!
//! Building blocks of the Upstox market feed relay. Modules are gated by cargo
//! features so that a consumer can pull in only the pieces it needs:
//!
//! - **`core`**: the distribution engine (broadcast hub, state cache, stats,
//!   reconnect policy and the frame decoder seam).
//! - **`markets`**: the Upstox MarketDataFeed V3 schema, its decoder and the
//!   endpoint authorization call.
//! - **`ingestors`**: the upstream WebSocket connector.
//! - **`retrieve`**: the retrying HTTP client.
//! - **`clients`**: a downstream consumer of the relay with automatic reconnection.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "markets")]
pub mod markets;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "retrieve")]
pub mod retrieve;
#[cfg(feature = "clients")]
pub mod clients;
