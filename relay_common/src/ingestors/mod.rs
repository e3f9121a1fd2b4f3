//! # Data Ingestors Module
//!
//! Clients that pull market data into the relay. There is a single upstream
//! today, the Upstox V3 WebSocket feed.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The upstream WebSocket connector for the Upstox feed.
pub mod upstox_wss;

pub use upstox_wss::{UpstoxWssConfig, UpstreamConnection, UpstreamConnector, UpstreamState};
