//! # Market Data Providers
//!
//! Provider specific schemas and adapters. Each provider implements
//! [`crate::core::FrameDecoder`] so the hub never sees a wire format.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Upstox MarketDataFeed V3.
pub mod upstox;
