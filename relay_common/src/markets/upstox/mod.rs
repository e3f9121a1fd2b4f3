//! # Upstox Market Data Feed
//!
//! Everything specific to the Upstox V3 feed: the protobuf wire types, the
//! JSON-facing model the relay fans out, the frame decoder and the REST call
//! that authorizes a feed session.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// REST exchange of an access token for a feed URI.
pub mod authorize;
/// Binary frame decoder.
pub mod decoder;
/// Serializable domain model.
pub mod model;
/// Hand-declared prost types for the V3 schema.
#[allow(missing_docs)]
pub mod proto_handler;

pub use authorize::{authorize, AuthorizeError, DEFAULT_AUTHORIZE_URL};
pub use decoder::UpstoxDecoder;
pub use model::{FeedMessage, FeedMode, QuoteSummary, SubscriptionRequest, SubscriptionSpec};
