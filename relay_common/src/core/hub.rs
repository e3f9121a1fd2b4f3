//! # Broadcast Hub
//!
//! The hub takes every decoded upstream message and fans it out to all
//! connected downstream subscribers.
//!
//! ## Design:
//!
//! 1.  **Membership table**: subscribers live in a table keyed by a stable
//!     [`SubscriberId`]. Each entry owns the sending half of a bounded queue
//!     drained by that subscriber's own writer task, so the hub never touches a
//!     socket directly.
//!
//! 2.  **Snapshot, then send**: a broadcast takes a snapshot of the table under
//!     the lock, releases it, and only then awaits the per-subscriber sends.
//!     Joins and leaves can happen while a broadcast is in flight.
//!
//! 3.  **Mark and sweep**: failed deliveries are collected during the fan-out
//!     and removed from the table in one pass afterwards. A failure only ever
//!     evicts the subscriber it happened on and never reaches the ingestion path.
//!
//! 4.  **Bounded sends**: every delivery is limited by `send_timeout`. A
//!     subscriber that cannot accept a payload in time is treated as failed.
//!
//! 5.  **Ordered bootstrap**: the cached snapshot is serialized before the
//!     table lock is taken, then pushed into the joiner's queue under the lock,
//!     before the joiner becomes visible to any later broadcast. If a broadcast
//!     replaced the snapshot in between, the join starts over. A joiner can
//!     therefore never see a newer message before the snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

use crate::core::decoder::FeedSnapshot;
use crate::core::error::{DeliveryError, RelayError};
use crate::core::state_cache::StateCache;
use crate::core::stats::{StatsCollector, StatsSnapshot};

/// Prefix of the only inbound payload the hub understands.
pub const LIVENESS_PING: &str = "ping";
/// Fixed reply to a liveness ping.
pub const LIVENESS_ACK: &str = "pong";

/// Stable identity of a subscriber for the lifetime of its membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// The raw numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tuning knobs for the hub.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Upper bound for a single delivery attempt.
    pub send_timeout: Duration,
    /// Capacity of each subscriber's outbound queue.
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            queue_capacity: 256,
        }
    }
}

/// Lifecycle notifications coming from the upstream connector.
#[derive(Debug)]
pub enum UpstreamEvent<M> {
    /// The upstream session is open and subscribed.
    Connected,
    /// A frame was decoded.
    Message(M),
    /// The upstream closed the session.
    Closed,
    /// The session failed, or reconnection gave up.
    Error(RelayError),
}

/// Status carried by a [`StatusNotice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    /// The upstream closed.
    Disconnected,
    /// The upstream failed.
    Error,
}

/// Discriminator of a [`StatusNotice`]; always `connection_status` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Upstream connectivity changed.
    ConnectionStatus,
}

/// Status notification synthesized by the hub when the upstream drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    /// Always [`NoticeKind::ConnectionStatus`].
    #[serde(rename = "type")]
    pub kind: NoticeKind,
    /// What happened to the upstream.
    pub status: UpstreamStatus,
    /// Human readable reason.
    pub message: String,
}

impl StatusNotice {
    /// Notice for an orderly upstream close.
    pub fn disconnected() -> Self {
        Self {
            kind: NoticeKind::ConnectionStatus,
            status: UpstreamStatus::Disconnected,
            message: "Market data connection lost".to_string(),
        }
    }

    /// Notice for an upstream failure.
    pub fn error(reason: impl fmt::Display) -> Self {
        Self {
            kind: NoticeKind::ConnectionStatus,
            status: UpstreamStatus::Error,
            message: format!("Market data error: {}", reason),
        }
    }
}

struct Member {
    queue: mpsc::Sender<Arc<str>>,
    joined_at: Instant,
}

/// Fan-out hub serving one upstream stream to many subscribers.
pub struct BroadcastHub<M> {
    members: Mutex<BTreeMap<SubscriberId, Member>>,
    cache: StateCache<M>,
    stats: StatsCollector,
    upstream_connected: AtomicBool,
    next_id: AtomicU64,
    // Serializes broadcasts so every subscriber sees them in decode order.
    fanout_gate: tokio::sync::Mutex<()>,
    config: HubConfig,
}

impl<M: FeedSnapshot> BroadcastHub<M> {
    /// Creates an empty hub. Counters and cache start here.
    pub fn new(config: HubConfig) -> Self {
        Self {
            members: Mutex::new(BTreeMap::new()),
            cache: StateCache::new(),
            stats: StatsCollector::new(),
            upstream_connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            fanout_gate: tokio::sync::Mutex::new(()),
            config: HubConfig {
                queue_capacity: config.queue_capacity.max(1),
                ..config
            },
        }
    }

    fn lock_members(&self) -> MutexGuard<'_, BTreeMap<SubscriberId, Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Subscriber Join
    ///
    /// Registers a new subscriber and returns its id together with the receiving
    /// half of its outbound queue. The caller drains the receiver into the
    /// subscriber's transport.
    ///
    /// If a snapshot is cached it is queued for the newcomer before the member
    /// is published. A failure here only skips the welcome payload.
    pub fn join(&self) -> (SubscriberId, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.stats.connection_accepted();

        let mut members = loop {
            let snapshot = self.cache.peek();
            let welcome = snapshot.as_deref().and_then(|m| match encode(m) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    log::warn!("Failed to serialize cached snapshot: {}", e);
                    None
                }
            });

            let members = self.lock_members();
            // The cache only changes under the table lock.
            if !same_snapshot(snapshot.as_ref(), self.cache.peek().as_ref()) {
                continue;
            }
            if let Some(payload) = welcome {
                match tx.try_send(payload) {
                    Ok(()) => {
                        self.stats.messages_sent(1);
                        log::debug!("Sent cached snapshot to subscriber {}", id);
                    }
                    Err(e) => log::warn!("Failed to send welcome data to {}: {}", id, e),
                }
            }
            break members;
        };
        members.insert(
            id,
            Member {
                queue: tx,
                joined_at: Instant::now(),
            },
        );
        let active = members.len();
        drop(members);

        log::info!("Subscriber {} joined (active: {})", id, active);
        (id, rx)
    }

    /// # Subscriber Message
    ///
    /// Control-plane hook for inbound payloads. A liveness ping is answered
    /// with [`LIVENESS_ACK`] through the subscriber's queue; anything else is
    /// logged and ignored. Returns whether an acknowledgment was queued.
    pub fn on_subscriber_message(&self, id: SubscriberId, payload: &str) -> bool {
        self.stats.message_received();

        if !payload.starts_with(LIVENESS_PING) {
            log::debug!("Subscriber {} says: {}", id, payload);
            return false;
        }

        let queue = self.lock_members().get(&id).map(|m| m.queue.clone());
        let Some(queue) = queue else {
            return false;
        };
        match queue.try_send(Arc::from(LIVENESS_ACK)) {
            Ok(()) => {
                self.stats.messages_sent(1);
                true
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Subscriber {} queue is full, dropping liveness ack", id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// # Subscriber Leave
    ///
    /// Removes the subscriber. Calling it twice, or for an evicted subscriber,
    /// is harmless. Returns whether a member was actually removed.
    pub fn leave(&self, id: SubscriberId) -> bool {
        let removed = self.lock_members().remove(&id);
        match removed {
            Some(member) => {
                log::info!(
                    "Subscriber {} left after {:.1}s",
                    id,
                    member.joined_at.elapsed().as_secs_f64()
                );
                true
            }
            None => false,
        }
    }

    /// # Upstream Message
    ///
    /// Updates the cache, then delivers the message to every current
    /// subscriber. The message is serialized once, and only when someone is
    /// listening.
    pub async fn on_upstream_message(&self, msg: M) {
        let msg = Arc::new(msg);
        let _gate = self.fanout_gate.lock().await;

        let targets = {
            let members = self.lock_members();
            self.cache.update(&msg);
            if members.is_empty() {
                log::trace!("No subscribers connected, skipping broadcast");
                return;
            }
            snapshot_targets(&members)
        };

        match encode(msg.as_ref()) {
            Ok(payload) => self.fan_out(targets, payload).await,
            Err(e) => log::error!("Failed to serialize upstream message: {}", e),
        }
    }

    /// Marks the upstream as open.
    pub fn on_upstream_connected(&self) {
        self.upstream_connected.store(true, Ordering::Relaxed);
        log::info!("Upstream connected");
    }

    /// Broadcasts a `disconnected` status after an orderly upstream close.
    pub async fn on_upstream_closed(&self) {
        self.upstream_connected.store(false, Ordering::Relaxed);
        log::warn!("Upstream connection closed, notifying subscribers");
        self.broadcast_notice(&StatusNotice::disconnected()).await;
    }

    /// Broadcasts an `error` status after an upstream failure.
    pub async fn on_upstream_error(&self, err: &RelayError) {
        self.upstream_connected.store(false, Ordering::Relaxed);
        log::error!("Upstream connection error: {}", err);
        self.broadcast_notice(&StatusNotice::error(err)).await;
    }

    /// Dispatches one lifecycle event to the matching handler.
    pub async fn handle_upstream(&self, event: UpstreamEvent<M>) {
        match event {
            UpstreamEvent::Connected => self.on_upstream_connected(),
            UpstreamEvent::Message(msg) => self.on_upstream_message(msg).await,
            UpstreamEvent::Closed => self.on_upstream_closed().await,
            UpstreamEvent::Error(err) => self.on_upstream_error(&err).await,
        }
    }

    async fn broadcast_notice(&self, notice: &StatusNotice) {
        let _gate = self.fanout_gate.lock().await;
        let targets = snapshot_targets(&self.lock_members());
        if targets.is_empty() {
            return;
        }
        match encode(notice) {
            Ok(payload) => self.fan_out(targets, payload).await,
            Err(e) => log::error!("Failed to serialize status notice: {}", e),
        }
    }

    async fn fan_out(&self, targets: Vec<(SubscriberId, mpsc::Sender<Arc<str>>)>, payload: Arc<str>) {
        let send_timeout = self.config.send_timeout;
        let attempts = targets.into_iter().map(|(id, queue)| {
            let payload = Arc::clone(&payload);
            async move { (id, deliver(id, &queue, payload, send_timeout).await) }
        });

        let mut delivered = 0u64;
        let mut failed = Vec::new();
        for (id, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Delivery failed: {}", e);
                    failed.push(id);
                }
            }
        }
        self.stats.messages_sent(delivered);

        if !failed.is_empty() {
            let mut members = self.lock_members();
            for id in &failed {
                if members.remove(id).is_some() {
                    log::info!("Evicted subscriber {}", id);
                }
            }
        }
    }

    /// Peeks at the cached snapshot.
    pub fn cached(&self) -> Option<Arc<M>> {
        self.cache.peek()
    }

    /// Current size of the subscriber set.
    pub fn subscriber_count(&self) -> usize {
        self.lock_members().len()
    }

    /// Whether the upstream is currently open.
    pub fn is_upstream_connected(&self) -> bool {
        self.upstream_connected.load(Ordering::Relaxed)
    }

    /// Read-only snapshot for the operational query.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.subscriber_count(), self.is_upstream_connected())
    }

    /// Drops every subscriber queue. Their writer tasks observe the closed
    /// queue and release their connections.
    pub fn close_all(&self) {
        let mut members = self.lock_members();
        let released = members.len();
        members.clear();
        log::info!("Released {} subscribers", released);
    }
}

fn snapshot_targets(
    members: &BTreeMap<SubscriberId, Member>,
) -> Vec<(SubscriberId, mpsc::Sender<Arc<str>>)> {
    members
        .iter()
        .map(|(id, m)| (*id, m.queue.clone()))
        .collect()
}

fn same_snapshot<M>(a: Option<&Arc<M>>, b: Option<&Arc<M>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

async fn deliver(
    id: SubscriberId,
    queue: &mpsc::Sender<Arc<str>>,
    payload: Arc<str>,
    send_timeout: Duration,
) -> Result<(), DeliveryError> {
    queue
        .send_timeout(payload, send_timeout)
        .await
        .map_err(|e| match e {
            SendTimeoutError::Timeout(_) => DeliveryError::TimedOut(id.as_u64()),
            SendTimeoutError::Closed(_) => DeliveryError::Closed(id.as_u64()),
        })
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Arc<str>, serde_json::Error> {
    serde_json::to_string(value).map(Arc::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ConnectionError;

    #[derive(Debug, Serialize)]
    struct Tick {
        seq: u32,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        feeds: Vec<f64>,
    }

    impl FeedSnapshot for Tick {
        fn has_feeds(&self) -> bool {
            !self.feeds.is_empty()
        }
    }

    fn tick(seq: u32) -> Tick {
        Tick {
            seq,
            feeds: vec![100.0 + seq as f64],
        }
    }

    fn hub() -> BroadcastHub<Tick> {
        BroadcastHub::new(HubConfig {
            send_timeout: Duration::from_millis(50),
            queue_capacity: 16,
        })
    }

    fn seq_of(payload: &str) -> u64 {
        let v: serde_json::Value = serde_json::from_str(payload).unwrap();
        v["seq"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_every_member_gets_each_message_once_in_order() {
        let hub = hub();
        let mut receivers: Vec<_> = (0..3).map(|_| hub.join().1).collect();

        hub.on_upstream_message(tick(1)).await;
        hub.on_upstream_message(tick(2)).await;

        for rx in receivers.iter_mut() {
            assert_eq!(seq_of(&rx.recv().await.unwrap()), 1);
            assert_eq!(seq_of(&rx.recv().await.unwrap()), 2);
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_failed_subscriber_is_evicted_and_others_still_served() {
        let hub = hub();
        let (_, mut rx_a) = hub.join();
        let (_, rx_b) = hub.join();
        drop(rx_b);

        hub.on_upstream_message(tick(1)).await;
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(seq_of(&rx_a.recv().await.unwrap()), 1);

        hub.on_upstream_message(tick(2)).await;
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(seq_of(&rx_a.recv().await.unwrap()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_times_out_without_blocking_others() {
        let hub = BroadcastHub::new(HubConfig {
            send_timeout: Duration::from_millis(200),
            queue_capacity: 1,
        });
        let (_, mut fast) = hub.join();
        let (stalled_id, _stalled) = hub.join();

        hub.on_upstream_message(tick(1)).await;
        assert_eq!(seq_of(&fast.recv().await.unwrap()), 1);

        // The stalled queue is still full from the first tick.
        hub.on_upstream_message(tick(2)).await;
        assert_eq!(seq_of(&fast.recv().await.unwrap()), 2);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(!hub.leave(stalled_id));
    }

    #[tokio::test]
    async fn test_joiner_receives_cached_snapshot_before_new_broadcasts() {
        let hub = hub();
        hub.on_upstream_message(tick(7)).await;
        hub.on_upstream_message(Tick { seq: 8, feeds: vec![] }).await;

        let (_, mut rx) = hub.join();
        hub.on_upstream_message(tick(9)).await;

        assert_eq!(seq_of(&rx.recv().await.unwrap()), 7);
        assert_eq!(seq_of(&rx.recv().await.unwrap()), 9);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_and_leave_while_a_broadcast_is_stuck_on_a_stalled_member() {
        let hub = Arc::new(BroadcastHub::new(HubConfig {
            send_timeout: Duration::from_secs(5),
            queue_capacity: 1,
        }));
        let (stalled_id, _stalled) = hub.join();
        let (_, mut steady) = hub.join();
        let (leaving_id, mut leaving) = hub.join();

        hub.on_upstream_message(tick(1)).await;
        assert_eq!(seq_of(&steady.recv().await.unwrap()), 1);
        assert_eq!(seq_of(&leaving.recv().await.unwrap()), 1);

        // The stalled queue still holds tick 1, so this send waits out its timeout.
        let in_flight = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.on_upstream_message(tick(2)).await })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(!in_flight.is_finished());

        let (_, mut late) = hub.join();
        assert!(hub.leave(leaving_id));

        in_flight.await.unwrap();
        assert!(!hub.leave(stalled_id));

        assert_eq!(seq_of(&late.recv().await.unwrap()), 2);
        assert_eq!(seq_of(&steady.recv().await.unwrap()), 2);

        hub.on_upstream_message(tick(3)).await;

        assert_eq!(seq_of(&late.recv().await.unwrap()), 3);
        assert!(late.try_recv().is_err());
        assert_eq!(seq_of(&steady.recv().await.unwrap()), 3);
        assert!(steady.try_recv().is_err());

        // Already targeted when it left, so it sees tick 2 and nothing after.
        assert_eq!(seq_of(&leaving.recv().await.unwrap()), 2);
        assert!(leaving.recv().await.is_none());

        assert_eq!(hub.subscriber_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_joins_racing_broadcasts_see_a_gapless_sequence() {
        let hub = Arc::new(BroadcastHub::new(HubConfig {
            send_timeout: Duration::from_secs(1),
            queue_capacity: 512,
        }));
        hub.on_upstream_message(tick(0)).await;

        let producer = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                for seq in 1..=200 {
                    hub.on_upstream_message(tick(seq)).await;
                }
            })
        };
        let mut receivers = Vec::new();
        for _ in 0..20 {
            receivers.push(hub.join().1);
            tokio::task::yield_now().await;
        }
        producer.await.unwrap();

        for mut rx in receivers {
            let mut seen = Vec::new();
            while let Ok(payload) = rx.try_recv() {
                seen.push(seq_of(&payload));
            }
            assert_eq!(seen.last(), Some(&200));
            assert!(
                seen.windows(2).all(|w| w[1] == w[0] + 1),
                "gap or repeat in {:?}",
                seen
            );
        }
    }

    #[tokio::test]
    async fn test_dead_joiner_is_only_evicted_by_a_broadcast() {
        let hub = hub();
        hub.on_upstream_message(tick(1)).await;

        let (_, rx) = hub.join();
        assert_eq!(hub.stats().total_messages_sent, 1);
        drop(rx);
        assert_eq!(hub.subscriber_count(), 1);

        hub.on_upstream_message(tick(2)).await;
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let hub = hub();
        let (id, _rx) = hub.join();
        assert!(hub.leave(id));
        assert!(!hub.leave(id));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_liveness_ping_is_acknowledged() {
        let hub = hub();
        let (id, mut rx) = hub.join();

        assert!(hub.on_subscriber_message(id, "ping"));
        assert!(!hub.on_subscriber_message(id, "subscribe NSE_FO|50979"));
        assert_eq!(&*rx.recv().await.unwrap(), LIVENESS_ACK);
        assert!(rx.try_recv().is_err());

        let stats = hub.stats();
        assert_eq!(stats.total_messages_received, 2);
        assert_eq!(stats.total_messages_sent, 1);
    }

    #[tokio::test]
    async fn test_upstream_loss_is_broadcast_as_status() {
        let hub = hub();
        let (_, mut rx) = hub.join();

        hub.handle_upstream(UpstreamEvent::Connected).await;
        assert!(hub.stats().upstream_connected);

        hub.handle_upstream(UpstreamEvent::Closed).await;
        let closed: StatusNotice = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(closed, StatusNotice::disconnected());

        let err = RelayError::Connection(ConnectionError::Transport("reset by peer".into()));
        hub.handle_upstream(UpstreamEvent::Error(err)).await;
        let raw = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["type"], "connection_status");
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "Market data error: transport error: reset by peer");
        assert!(!hub.stats().upstream_connected);
    }

    #[tokio::test]
    async fn test_status_does_not_replace_cache() {
        let hub = hub();
        hub.on_upstream_message(tick(3)).await;
        hub.on_upstream_closed().await;
        assert_eq!(hub.cached().map(|t| t.seq), Some(3));
    }

    #[tokio::test]
    async fn test_stats_after_joins_broadcasts_and_one_failure() {
        let hub = hub();
        let (_, mut rx_1) = hub.join();
        let (_, rx_2) = hub.join();
        let (_, mut rx_3) = hub.join();
        drop(rx_2);

        hub.on_upstream_message(tick(1)).await;
        hub.on_upstream_message(tick(2)).await;

        let stats = hub.stats();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.active_subscribers, 2);
        assert_eq!(stats.total_messages_sent, 4);

        for rx in [&mut rx_1, &mut rx_3] {
            assert_eq!(seq_of(&rx.recv().await.unwrap()), 1);
            assert_eq!(seq_of(&rx.recv().await.unwrap()), 2);
        }
    }

    #[tokio::test]
    async fn test_close_all_releases_queues() {
        let hub = hub();
        let (_, mut rx) = hub.join();
        hub.close_all();
        assert_eq!(hub.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }
}
