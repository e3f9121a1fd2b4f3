//! # Data Retrieval Module
//!
//! HTTP plumbing shared by the market adapters. The relay only needs a single
//! REST call (the feed authorization), but it goes through the same retrying
//! client any further endpoint would use.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware.
pub mod ky_http;

pub use ky_http::{ApiClient, ApiResponse};
