//! # Relay Client
//!
//! Subscribes to a relay over WebSocket and keeps the subscription alive with a
//! [`ReconnectPolicy`]. Connectivity is published on a `watch` channel as a
//! [`ClientStatus`]; frames are parsed and forwarded as [`ClientEvent`]s.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

use crate::core::error::RelayError;
use crate::core::hub::{StatusNotice, LIVENESS_ACK, LIVENESS_PING};
use crate::core::reconnect::{
    ConnectionState, DisconnectHandle, ReconnectConfig, ReconnectOutcome, ReconnectPolicy,
};
use crate::markets::upstox::FeedMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:4000/stream";

/// Client settings.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// `ws://` or `wss://` URL of the relay stream.
    pub url: String,
    /// Backoff applied after an unexpected close.
    pub reconnect: ReconnectConfig,
    /// Send a liveness ping at this interval while connected.
    pub ping_interval: Option<Duration>,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            ping_interval: None,
        }
    }
}

/// Connectivity as shown to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    /// A connection attempt is in flight.
    Connecting,
    /// Subscribed to the relay.
    Connected,
    /// Not connected; a retry may be pending.
    Disconnected,
    /// Reconnection gave up.
    Error,
}

impl From<&ConnectionState> for ClientStatus {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting => ClientStatus::Connecting,
            ConnectionState::Connected => ClientStatus::Connected,
            ConnectionState::Idle | ConnectionState::Reconnecting { .. } => {
                ClientStatus::Disconnected
            }
            ConnectionState::GaveUp { .. } => ClientStatus::Error,
        }
    }
}

/// Any JSON frame the relay sends downstream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RelayFrame {
    /// Upstream connectivity notice.
    Status(StatusNotice),
    /// Decoded market data.
    Feed(FeedMessage),
}

impl RelayFrame {
    /// Parses one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// What the client hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The relay session opened.
    Connected,
    /// The relay session closed.
    Disconnected,
    /// A market data frame.
    Feed(FeedMessage),
    /// An upstream status notice relayed by the hub.
    Notice(StatusNotice),
    /// The relay acknowledged a liveness ping.
    Pong,
}

/// Cloneable handle for writing text frames to the relay.
///
/// Frames are only accepted while a session is open. Nothing is buffered
/// across reconnects.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::Sender<String>,
    status: watch::Receiver<ClientStatus>,
}

impl RelaySender {
    /// Queues `text` for the open session without waiting. Returns `false`,
    /// dropping the frame, when the client is not connected or the outbound
    /// queue is full.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        let status = *self.status.borrow();
        if status != ClientStatus::Connected {
            log::warn!("Relay is {:?}, dropping outbound frame", status);
            return false;
        }
        match self.tx.try_send(text.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound queue is full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queues a liveness ping.
    pub fn ping(&self) -> bool {
        self.send_text(LIVENESS_PING)
    }
}

/// Reconnecting relay subscriber.
pub struct RelayClient {
    config: RelayClientConfig,
    policy: ReconnectPolicy,
    status: watch::Receiver<ClientStatus>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: mpsc::Receiver<String>,
}

enum SessionEnd {
    Dropped,
    Manual,
}

impl RelayClient {
    /// Creates a client that has not connected yet.
    pub fn new(config: RelayClientConfig) -> Self {
        let mut policy = ReconnectPolicy::new(config.reconnect);
        let (status_tx, status) = watch::channel(ClientStatus::Disconnected);
        policy.on_transition(move |state| {
            status_tx.send_replace(ClientStatus::from(state));
        });
        let (outbound_tx, outbound_rx) = mpsc::channel(32);

        Self {
            config,
            policy,
            status,
            outbound_tx,
            outbound_rx,
        }
    }

    /// Watches connectivity changes.
    pub fn status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Handle for a manual disconnect. Suppresses every pending retry.
    pub fn disconnect_handle(&self) -> DisconnectHandle {
        self.policy.disconnect_handle()
    }

    /// Handle for outbound text frames.
    pub fn sender(&self) -> RelaySender {
        RelaySender {
            tx: self.outbound_tx.clone(),
            status: self.status.clone(),
        }
    }

    /// # Run
    ///
    /// Connects and keeps reconnecting until a manual disconnect (`Ok`) or
    /// until the policy gives up (`Err(ExhaustedRetries)`).
    pub async fn run(mut self, events: mpsc::Sender<ClientEvent>) -> Result<(), RelayError> {
        self.policy.connect();
        let handle = self.policy.disconnect_handle();

        loop {
            let attempt = tokio::select! {
                _ = handle.disconnected() => None,
                res = connect_async(self.config.url.as_str()) => Some(res),
            };

            match attempt {
                None => {}
                Some(Ok((ws, _))) => {
                    log::info!("Connected to relay {}", self.config.url);
                    // Leftovers raced the previous session's close.
                    while self.outbound_rx.try_recv().is_ok() {}
                    self.policy.on_connected();
                    if events.send(ClientEvent::Connected).await.is_err() {
                        handle.disconnect();
                    }
                    let end = self.session(ws, &events, &handle).await;
                    log::warn!("Disconnected from relay {}", self.config.url);
                    let _ = events.send(ClientEvent::Disconnected).await;
                    if matches!(end, SessionEnd::Manual) {
                        handle.disconnect();
                    }
                }
                Some(Err(e)) => {
                    log::error!("Relay connection to {} failed: {}", self.config.url, e);
                }
            }

            match self.policy.after_disconnect().await {
                ReconnectOutcome::Reconnect => continue,
                ReconnectOutcome::Stopped => return Ok(()),
                ReconnectOutcome::GaveUp(err) => return Err(err),
            }
        }
    }

    async fn session(
        &mut self,
        ws: WsStream,
        events: &mpsc::Sender<ClientEvent>,
        handle: &DisconnectHandle,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        // A disabled ping still needs a timer to select on.
        let period = self.config.ping_interval.unwrap_or(Duration::from_secs(3600));
        let mut pinger = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = handle.disconnected() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Manual;
                }
                Some(text) = self.outbound_rx.recv() => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                _ = pinger.tick(), if self.config.ping_interval.is_some() => {
                    if write.send(Message::Text(LIVENESS_PING.into())).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = interpret(text.as_str()) {
                            if events.send(event).await.is_err() {
                                let _ = write.send(Message::Close(None)).await;
                                return SessionEnd::Manual;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Err(e)) => {
                        log::error!("Relay read error: {}", e);
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

fn interpret(text: &str) -> Option<ClientEvent> {
    if text == LIVENESS_ACK {
        return Some(ClientEvent::Pong);
    }
    match RelayFrame::parse(text) {
        Ok(RelayFrame::Status(notice)) => Some(ClientEvent::Notice(notice)),
        Ok(RelayFrame::Feed(feed)) => Some(ClientEvent::Feed(feed)),
        Err(e) => {
            log::warn!("Failed to parse relay frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hub::UpstreamStatus;
    use crate::markets::upstox::model::FeedType;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const FEED: &str = r#"{"type":"live_feed","feeds":{"NSE_FO|50979":{"ltpc":{"ltp":101.0,"ltt":1,"ltq":2,"cp":100.0},"requestMode":"ltpc"}},"currentTs":7}"#;

    fn fast_config(url: String, max_attempts: u32) -> RelayClientConfig {
        RelayClientConfig {
            url,
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(10),
                max_attempts,
                max_delay: None,
            },
            ping_interval: None,
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ClientStatus::from(&ConnectionState::Connecting), ClientStatus::Connecting);
        assert_eq!(ClientStatus::from(&ConnectionState::Connected), ClientStatus::Connected);
        assert_eq!(
            ClientStatus::from(&ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(1)
            }),
            ClientStatus::Disconnected
        );
        assert_eq!(ClientStatus::from(&ConnectionState::GaveUp { attempts: 5 }), ClientStatus::Error);
    }

    #[test]
    fn test_interprets_each_frame_kind() {
        assert_eq!(interpret("pong"), Some(ClientEvent::Pong));

        match interpret(r#"{"type":"connection_status","status":"disconnected","message":"Market data connection lost"}"#) {
            Some(ClientEvent::Notice(notice)) => assert_eq!(notice.status, UpstreamStatus::Disconnected),
            other => panic!("unexpected {:?}", other),
        }

        match interpret(FEED) {
            Some(ClientEvent::Feed(feed)) => {
                assert_eq!(feed.kind, FeedType::LiveFeed);
                let quote = feed.first_quote().unwrap();
                assert_eq!(quote.ltp, 101.0);
                assert!((quote.change_percent.unwrap() - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(interpret("not json"), None);
    }

    #[tokio::test]
    async fn test_gives_up_against_unreachable_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RelayClient::new(fast_config(format!("ws://{}/stream", addr), 2));
        let status = client.status();
        let (tx, _rx) = mpsc::channel(8);

        let result = client.run(tx).await;
        assert_eq!(result, Err(RelayError::ExhaustedRetries { attempts: 2 }));
        assert_eq!(*status.borrow(), ClientStatus::Error);
    }

    #[tokio::test]
    async fn test_receives_frames_then_stops_on_manual_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(FEED.into())).await.unwrap();
            // Hold the session open until the client leaves.
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    if text.as_str() == LIVENESS_PING {
                        ws.send(Message::Text(LIVENESS_ACK.into())).await.unwrap();
                    }
                }
            }
        });

        let client = RelayClient::new(fast_config(format!("ws://{}/stream", addr), 5));
        let handle = client.disconnect_handle();
        let sender = client.sender();
        let status = client.status();
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(client.run(tx));

        assert_eq!(rx.recv().await, Some(ClientEvent::Connected));
        assert!(matches!(rx.recv().await, Some(ClientEvent::Feed(_))));
        assert_eq!(*status.borrow(), ClientStatus::Connected);

        assert!(sender.ping());
        assert_eq!(rx.recv().await, Some(ClientEvent::Pong));

        handle.disconnect();
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(*status.borrow(), ClientStatus::Disconnected);
        assert!(!sender.ping());
    }

    #[tokio::test]
    async fn test_sender_drops_frames_until_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RelayClient::new(fast_config(format!("ws://{}/stream", addr), 2));
        let sender = client.sender();
        for i in 0..64 {
            assert!(!sender.send_text(format!("hello {}", i)));
        }
        assert!(!sender.ping());

        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(
            client.run(tx).await,
            Err(RelayError::ExhaustedRetries { attempts: 2 })
        );
        assert!(!sender.ping());
    }
}
