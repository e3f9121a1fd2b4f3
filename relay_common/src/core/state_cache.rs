//! # Last Known State Cache
//!
//! Holds zero or one message: the most recent one that carried feed data. New
//! subscribers are bootstrapped from it so they do not have to wait for the next
//! tick. The value is replaced wholesale, never merged.

use std::sync::{Arc, RwLock};

use crate::core::decoder::FeedSnapshot;

/// Single-slot cache of the latest qualifying snapshot.
pub struct StateCache<M> {
    slot: RwLock<Option<Arc<M>>>,
}

impl<M: FeedSnapshot> StateCache<M> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Stores `msg` if and only if it carries feeds. Returns whether the cached
    /// value was replaced.
    pub fn update(&self, msg: &Arc<M>) -> bool {
        if !msg.has_feeds() {
            return false;
        }
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::clone(msg));
        true
    }

    /// Returns the cached snapshot, if any.
    pub fn peek(&self) -> Option<Arc<M>> {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Arc::clone)
    }
}

impl<M: FeedSnapshot> Default for StateCache<M> {
    fn default() -> Self {
        Self::new()
    }
}
