//! # Reconnect Policy
//!
//! A bounded exponential backoff state machine for any connection that has to
//! recover from an unexpected drop. The downstream relay client and the
//! upstream supervisor both drive one.
//!
//! ```text
//! Idle -> Connecting -> Connected -> (unexpected close) Reconnecting -> Connecting -> ...
//!                                                        \-> GaveUp (after max_attempts)
//! ```
//!
//! The n-th attempt (n starting at 1) is scheduled `base_delay * 2^(n-1)` after
//! the drop, optionally capped by `max_delay`. A successful connection resets
//! the counter. A manual disconnect cancels the session token: any pending wait
//! returns early and no further attempt is scheduled until `connect` is called
//! again.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::error::RelayError;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Attempts allowed after a drop before giving up.
    pub max_attempts: u32,
    /// Optional ceiling for a single delay.
    pub max_delay: Option<Duration>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
            max_delay: None,
        }
    }
}

/// Connectivity state reported to transition listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    Idle,
    /// A connection attempt is in progress.
    Connecting,
    /// The connection is open.
    Connected,
    /// Waiting `delay` before attempt number `attempt`.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// Every attempt was used. Terminal until `connect` is called again.
    GaveUp {
        /// Attempts that were made.
        attempts: u32,
    },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {} in {}ms)", attempt, delay.as_millis())
            }
            ConnectionState::GaveUp { attempts } => write!(f, "gave up after {} attempts", attempts),
        }
    }
}

/// What the policy wants done after a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`.
    RetryAfter {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// The session was closed on purpose; do nothing.
    Stop,
    /// Every attempt was used; surface the error.
    GiveUp(RelayError),
}

/// Outcome of [`ReconnectPolicy::after_disconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The backoff elapsed; connect again.
    Reconnect,
    /// A manual disconnect happened before or during the wait.
    Stopped,
    /// The policy is exhausted.
    GaveUp(RelayError),
}

/// Cloneable handle that performs a manual disconnect from another task.
#[derive(Debug, Clone)]
pub struct DisconnectHandle {
    token: CancellationToken,
}

impl DisconnectHandle {
    /// Suppresses any pending or future automatic reconnection for the session.
    pub fn disconnect(&self) {
        self.token.cancel();
    }

    /// Whether a manual disconnect was requested.
    pub fn is_disconnected(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a manual disconnect is requested.
    pub async fn disconnected(&self) {
        self.token.cancelled().await
    }
}

type Listener = Box<dyn Fn(&ConnectionState) + Send + Sync>;

/// Bounded exponential backoff state machine.
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    state: ConnectionState,
    attempts: u32,
    current_delay: Duration,
    session: CancellationToken,
    listeners: Vec<Listener>,
}

impl ReconnectPolicy {
    /// Creates an idle policy.
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            attempts: 0,
            current_delay: config.base_delay,
            session: CancellationToken::new(),
            listeners: Vec::new(),
        }
    }

    /// Registers a callback fired on every state change.
    pub fn on_transition(&mut self, listener: impl Fn(&ConnectionState) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Attempts made since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay of the most recently scheduled attempt, or the base delay.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Whether the current session was closed on purpose.
    pub fn is_manually_disconnected(&self) -> bool {
        self.session.is_cancelled()
    }

    /// Handle for a manual disconnect of the current session.
    pub fn disconnect_handle(&self) -> DisconnectHandle {
        DisconnectHandle {
            token: self.session.clone(),
        }
    }

    /// Explicit connect request. Starts a fresh session after a manual
    /// disconnect and re-arms an exhausted policy.
    pub fn connect(&mut self) {
        if self.session.is_cancelled() {
            self.session = CancellationToken::new();
        }
        if matches!(self.state, ConnectionState::GaveUp { .. }) {
            self.reset();
        }
        self.set_state(ConnectionState::Connecting);
    }

    /// The scheduled backoff elapsed and an automatic attempt starts.
    pub fn begin_attempt(&mut self) {
        self.set_state(ConnectionState::Connecting);
    }

    /// The connection opened. Resets the counter and delay.
    pub fn on_connected(&mut self) {
        self.reset();
        self.set_state(ConnectionState::Connected);
    }

    /// The connection closed or an attempt failed. Decides what happens next.
    pub fn on_disconnected(&mut self) -> ReconnectDecision {
        if self.session.is_cancelled() {
            self.set_state(ConnectionState::Idle);
            return ReconnectDecision::Stop;
        }

        if self.attempts >= self.config.max_attempts {
            let attempts = self.attempts;
            log::error!("Max reconnection attempts reached ({})", attempts);
            self.set_state(ConnectionState::GaveUp { attempts });
            return ReconnectDecision::GiveUp(RelayError::ExhaustedRetries { attempts });
        }

        self.attempts += 1;
        let attempt = self.attempts;
        let delay = self.delay_for(attempt);
        self.current_delay = delay;
        log::info!(
            "Attempting to reconnect ({}/{}) in {}ms",
            attempt,
            self.config.max_attempts,
            delay.as_millis()
        );
        self.set_state(ConnectionState::Reconnecting { attempt, delay });
        ReconnectDecision::RetryAfter { attempt, delay }
    }

    /// Manual disconnect from the owning task.
    pub fn disconnect(&mut self) {
        self.session.cancel();
        self.set_state(ConnectionState::Idle);
    }

    /// Sleeps for `delay` unless the session is disconnected first. Returns
    /// `true` when the full delay elapsed.
    pub async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.session.cancelled() => false,
            _ = tokio::time::sleep(delay) => !self.session.is_cancelled(),
        }
    }

    /// Convenience driver step: decide, wait out the backoff and move to
    /// `Connecting` when another attempt is due.
    pub async fn after_disconnect(&mut self) -> ReconnectOutcome {
        match self.on_disconnected() {
            ReconnectDecision::RetryAfter { delay, .. } => {
                if self.wait(delay).await {
                    self.begin_attempt();
                    ReconnectOutcome::Reconnect
                } else {
                    self.set_state(ConnectionState::Idle);
                    ReconnectOutcome::Stopped
                }
            }
            ReconnectDecision::Stop => ReconnectOutcome::Stopped,
            ReconnectDecision::GiveUp(err) => ReconnectOutcome::GaveUp(err),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.config.base_delay.saturating_mul(1u32 << exponent);
        match self.config.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.base_delay;
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        log::debug!("Connection state: {} -> {}", self.state, next);
        self.state = next;
        for listener in &self.listeners {
            listener(&self.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn policy(base_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            base_delay: Duration::from_millis(base_ms),
            max_attempts,
            max_delay: None,
        })
    }

    #[test]
    fn test_delays_double_until_exhausted() {
        let mut policy = policy(1000, 5);
        policy.connect();
        policy.on_connected();

        let mut delays = Vec::new();
        loop {
            match policy.on_disconnected() {
                ReconnectDecision::RetryAfter { delay, .. } => {
                    delays.push(delay.as_millis() as u64);
                    policy.begin_attempt();
                }
                ReconnectDecision::GiveUp(err) => {
                    assert_eq!(err, RelayError::ExhaustedRetries { attempts: 5 });
                    break;
                }
                ReconnectDecision::Stop => panic!("unexpected stop"),
            }
        }

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(policy.state(), &ConnectionState::GaveUp { attempts: 5 });
        // Still exhausted: nothing else gets scheduled.
        assert!(matches!(policy.on_disconnected(), ReconnectDecision::GiveUp(_)));
    }

    #[test]
    fn test_success_resets_counter_and_delay() {
        let mut policy = policy(500, 3);
        policy.connect();
        policy.on_connected();
        policy.on_disconnected();
        policy.begin_attempt();
        policy.on_disconnected();
        assert_eq!(policy.attempts(), 2);
        assert_eq!(policy.current_delay(), Duration::from_millis(1000));

        policy.begin_attempt();
        policy.on_connected();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.current_delay(), Duration::from_millis(500));
        assert_eq!(
            policy.on_disconnected(),
            ReconnectDecision::RetryAfter {
                attempt: 1,
                delay: Duration::from_millis(500)
            }
        );
    }

    #[test]
    fn test_max_delay_caps_growth() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            base_delay: Duration::from_secs(1),
            max_attempts: 10,
            max_delay: Some(Duration::from_secs(5)),
        });
        policy.connect();
        let delays: Vec<_> = (0..5)
            .map(|_| match policy.on_disconnected() {
                ReconnectDecision::RetryAfter { delay, .. } => delay.as_secs(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_cancels_pending_attempt() {
        let mut policy = policy(1000, 5);
        policy.connect();
        policy.on_connected();

        let handle = policy.disconnect_handle();
        let delay = match policy.on_disconnected() {
            ReconnectDecision::RetryAfter { delay, .. } => delay,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(policy.state(), ConnectionState::Reconnecting { .. }));

        handle.disconnect();
        let started = tokio::time::Instant::now();
        assert!(!policy.wait(delay).await);
        assert!(started.elapsed() < delay);

        assert_eq!(policy.on_disconnected(), ReconnectDecision::Stop);
        assert_eq!(policy.state(), &ConnectionState::Idle);

        // Only an explicit connect starts a new session.
        policy.connect();
        assert!(!policy.is_manually_disconnected());
        assert!(matches!(
            policy.on_disconnected(),
            ReconnectDecision::RetryAfter { attempt: 2, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_disconnect_waits_full_backoff() {
        let mut policy = policy(1000, 1);
        policy.connect();

        let started = tokio::time::Instant::now();
        assert_eq!(policy.after_disconnect().await, ReconnectOutcome::Reconnect);
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(policy.state(), &ConnectionState::Connecting);

        assert_eq!(
            policy.after_disconnect().await,
            ReconnectOutcome::GaveUp(RelayError::ExhaustedRetries { attempts: 1 })
        );
    }

    #[test]
    fn test_every_transition_is_reported() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut policy = policy(100, 1);
        let sink = Arc::clone(&seen);
        policy.on_transition(move |state| sink.lock().unwrap().push(state.clone()));

        policy.connect();
        policy.on_connected();
        policy.on_disconnected();
        policy.begin_attempt();
        policy.on_disconnected();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting {
                    attempt: 1,
                    delay: Duration::from_millis(100)
                },
                ConnectionState::Connecting,
                ConnectionState::GaveUp { attempts: 1 },
            ]
        );
    }

    #[test]
    fn test_connect_rearms_exhausted_policy() {
        let mut policy = policy(100, 1);
        policy.connect();
        policy.on_disconnected();
        assert!(matches!(policy.on_disconnected(), ReconnectDecision::GiveUp(_)));

        policy.connect();
        assert_eq!(policy.attempts(), 0);
        assert!(matches!(
            policy.on_disconnected(),
            ReconnectDecision::RetryAfter { attempt: 1, .. }
        ));
    }
}
