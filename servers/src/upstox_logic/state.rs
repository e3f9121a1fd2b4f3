use relay_common::core::BroadcastHub;
use relay_common::markets::upstox::FeedMessage;
use std::sync::Arc;
use std::time::Instant;

/// The hub specialised to the Upstox feed.
pub type RelayHub = BroadcastHub<FeedMessage>;

/// Shared by every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(hub: Arc<RelayHub>) -> Self {
        Self {
            hub,
            started_at: Instant::now(),
        }
    }
}
