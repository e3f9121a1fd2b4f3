//! # Upstox WSS Ingestor
//!
//! Owns one upstream session at a time: dial, subscribe, decode every binary
//! frame and report the session lifecycle as [`UpstreamEvent`]s over a channel.
//! A session never reconnects by itself; the caller drives that with a
//! [`crate::core::ReconnectPolicy`].

use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::core::decoder::FrameDecoder;
use crate::core::error::ConnectionError;
use crate::core::hub::UpstreamEvent;
use crate::markets::upstox::SubscriptionSpec;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings of the upstream leg.
#[derive(Debug, Clone)]
pub struct UpstoxWssConfig {
    /// What to subscribe to after every connect.
    pub subscription: SubscriptionSpec,
    /// Longest silence tolerated before the session counts as dead.
    pub idle_timeout: Duration,
}

/// Lifecycle of one upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    /// Handshake in progress.
    Connecting,
    /// Subscribed and receiving.
    Open,
    /// Ended by the remote side or by shutdown.
    Closed,
    /// Ended by a transport failure or the idle watchdog.
    Failed,
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpstreamState::Connecting => "connecting",
            UpstreamState::Open => "open",
            UpstreamState::Closed => "closed",
            UpstreamState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An open, subscribed upstream session.
pub struct UpstreamConnection {
    stream: WsStream,
    state: UpstreamState,
}

impl UpstreamConnection {
    /// Current lifecycle state.
    pub fn state(&self) -> UpstreamState {
        self.state
    }
}

/// Dials the feed and runs its receive loop.
pub struct UpstreamConnector<D> {
    decoder: D,
    config: UpstoxWssConfig,
}

impl<D: FrameDecoder> UpstreamConnector<D> {
    /// Creates a connector using `decoder` for every frame.
    pub fn new(decoder: D, config: UpstoxWssConfig) -> Self {
        Self { decoder, config }
    }

    /// The configured subscription.
    pub fn subscription(&self) -> &SubscriptionSpec {
        &self.config.subscription
    }

    /// # Connect
    ///
    /// Performs the WebSocket handshake with `endpoint` and immediately sends
    /// one subscription request built from `spec` as a binary JSON frame.
    pub async fn connect(
        &self,
        endpoint: &str,
        spec: &SubscriptionSpec,
    ) -> Result<UpstreamConnection, ConnectionError> {
        log::info!("Connecting to upstream feed {}", redact(endpoint));
        let (mut stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| ConnectionError::Handshake {
                endpoint: redact(endpoint),
                reason: e.to_string(),
            })?;

        let request = spec.request();
        let body =
            serde_json::to_vec(&request).map_err(|e| ConnectionError::Subscribe(e.to_string()))?;
        stream
            .send(Message::Binary(body.into()))
            .await
            .map_err(|e| ConnectionError::Subscribe(e.to_string()))?;

        log::info!(
            "Subscribed to {} instrument(s) in {:?} mode ({})",
            spec.instrument_keys.len(),
            spec.mode,
            request.guid
        );
        Ok(UpstreamConnection {
            stream,
            state: UpstreamState::Open,
        })
    }

    /// # Session Loop
    ///
    /// Emits `Connected`, then one `Message` per decodable frame, then exactly
    /// one terminal `Closed` or `Error` unless `shutdown` fired first. Returns
    /// the final state; the connection is released either way.
    pub async fn run(
        &self,
        mut conn: UpstreamConnection,
        events: &mpsc::Sender<UpstreamEvent<D::Message>>,
        shutdown: &CancellationToken,
    ) -> UpstreamState {
        if events.send(UpstreamEvent::Connected).await.is_err() {
            return UpstreamState::Closed;
        }

        conn.state = self.pump(&mut conn.stream, events, shutdown).await;
        if shutdown.is_cancelled() {
            // Best effort; the remote may already be gone.
            let _ = conn.stream.close(None).await;
        }
        log::info!("Upstream session ended ({})", conn.state);
        conn.state
    }

    /// Receive loop over any frame stream. Decode failures skip one frame.
    pub async fn pump<S>(
        &self,
        stream: &mut S,
        events: &mpsc::Sender<UpstreamEvent<D::Message>>,
        shutdown: &CancellationToken,
    ) -> UpstreamState
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let idle = self.config.idle_timeout;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return UpstreamState::Closed,
                next = tokio::time::timeout(idle, stream.next()) => next,
            };

            let terminal = match next {
                Err(_) => {
                    log::warn!("Inactivity timeout ({}s) on upstream feed", idle.as_secs());
                    Some((
                        UpstreamState::Failed,
                        UpstreamEvent::Error(ConnectionError::Idle(idle.as_secs()).into()),
                    ))
                }
                Ok(None) => {
                    log::warn!("Upstream stream ended");
                    Some((UpstreamState::Closed, UpstreamEvent::Closed))
                }
                Ok(Some(Err(e))) => {
                    log::error!("Upstream read error: {}", e);
                    Some((
                        UpstreamState::Failed,
                        UpstreamEvent::Error(ConnectionError::Transport(e.to_string()).into()),
                    ))
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    log::warn!("Upstream closed the session: {:?}", frame);
                    Some((UpstreamState::Closed, UpstreamEvent::Closed))
                }
                Ok(Some(Ok(Message::Binary(frame)))) => match self.decoder.decode(&frame) {
                    Ok(msg) => {
                        if events.send(UpstreamEvent::Message(msg)).await.is_err() {
                            return UpstreamState::Closed;
                        }
                        None
                    }
                    Err(e) => {
                        log::warn!("Discarding upstream frame ({} bytes): {}", frame.len(), e);
                        None
                    }
                },
                Ok(Some(Ok(Message::Text(text)))) => {
                    log::debug!("Upstream text frame: {}", text.as_str());
                    None
                }
                // Ping, pong and raw frames only prove liveness.
                Ok(Some(Ok(_))) => None,
            };

            if let Some((state, event)) = terminal {
                let _ = events.send(event).await;
                return state;
            }
        }
    }
}

// The authorized URI embeds a one-time code; keep it out of logs.
fn redact(endpoint: &str) -> String {
    match endpoint.split_once('?') {
        Some((base, _)) => format!("{}?…", base),
        None => endpoint.to_string(),
    }
}
