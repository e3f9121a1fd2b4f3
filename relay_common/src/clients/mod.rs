//! # Relay Clients
//!
//! Consumers of the relay's own downstream stream, used by tools and tests
//! that need to watch the relay the way a subscriber does.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Reconnecting WebSocket client for the relay's `/stream` endpoint.
pub mod relay_client;

pub use relay_client::{ClientEvent, ClientStatus, RelayClient, RelayClientConfig, RelayFrame, RelaySender};
