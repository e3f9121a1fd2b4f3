//! # Relay Counters
//!
//! Lock-free accounting for the operational query. Each counter is an
//! `AtomicU64` updated with `Ordering::Relaxed`: the counters are independent
//! and only their eventual values matter, so no ordering with other memory
//! operations is needed.
//!
//! The active subscriber count is not kept here. It is derived from the hub's
//! membership table when a snapshot is taken.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic counters owned by a [`BroadcastHub`](crate::core::hub::BroadcastHub).
#[derive(Debug, Default)]
pub struct StatsCollector {
    total_connections: AtomicU64,
    total_messages_received: AtomicU64,
    total_messages_sent: AtomicU64,
}

impl StatsCollector {
    /// Creates a collector with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted downstream connection.
    pub fn connection_accepted(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an inbound message from a subscriber.
    pub fn message_received(&self) {
        self.total_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `count` successful deliveries.
    pub fn messages_sent(&self, count: u64) {
        if count > 0 {
            self.total_messages_sent.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Builds a read-only snapshot. The caller supplies the derived values.
    pub fn snapshot(&self, active_subscribers: usize, upstream_connected: bool) -> StatsSnapshot {
        StatsSnapshot {
            active_subscribers,
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_messages_received: self.total_messages_received.load(Ordering::Relaxed),
            total_messages_sent: self.total_messages_sent.load(Ordering::Relaxed),
            upstream_connected,
        }
    }
}

/// Result of the operational query, serialized as the `/ws-stats` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Current size of the subscriber set.
    pub active_subscribers: usize,
    /// Downstream connections accepted since start.
    pub total_connections: u64,
    /// Inbound subscriber messages since start.
    pub total_messages_received: u64,
    /// Successful deliveries since start.
    pub total_messages_sent: u64,
    /// Whether the upstream feed is currently open.
    pub upstream_connected: bool,
}
