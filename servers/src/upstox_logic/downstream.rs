use crate::upstox_logic::config::RelaySettings;
use crate::upstox_logic::state::{AppState, RelayHub};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/stream", get(stream_handler))
        .route("/ws-stats", get(stats_handler))
        .with_state(state)
}

pub async fn run(
    settings: Arc<RelaySettings>,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    if let Some(tls) = &settings.tls {
        let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
            .await
            .context("Failed to load TLS configuration")?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            log::info!("Downstream server shutting down.");
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        log::info!("Downstream server listening on wss://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("TLS server failed")?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        log::info!("Downstream server listening on ws://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                log::info!("Downstream server shutting down.");
            })
            .await
            .context("Server failed")?;
    }
    Ok(())
}

async fn root_handler() -> &'static str {
    "Upstox market feed relay running"
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "uptimeSeconds": state.started_at.elapsed().as_secs(),
            "upstreamConnected": state.hub.is_upstream_connected(),
        })),
    )
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stats())
}

async fn stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

/// One subscriber connection: drains its hub queue into the socket and feeds
/// inbound text to the hub until either side goes away.
async fn handle_socket(socket: WebSocket, hub: Arc<RelayHub>) {
    let (id, mut queue) = hub.join();
    let (mut sink, mut inbound) = socket.split();

    loop {
        tokio::select! {
            outgoing = queue.recv() => match outgoing {
                Some(payload) => {
                    if sink.send(Message::Text(Utf8Bytes::from(&*payload))).await.is_err() {
                        break;
                    }
                }
                // Evicted or released at shutdown.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = inbound.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    hub.on_subscriber_message(id, text.as_str());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    hub.on_subscriber_message(id, &String::from_utf8_lossy(&bytes));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("Subscriber {} read error: {}", id, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    hub.leave(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::core::{HubConfig, StatsSnapshot};
    use relay_common::markets::upstox::model::{
        Feed, FeedData, FeedMessage, FeedType, Ltpc, RequestMode,
    };
    use std::collections::BTreeMap;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    fn tick(ltp: f64) -> FeedMessage {
        let mut feeds = BTreeMap::new();
        feeds.insert(
            "NSE_FO|50979".to_string(),
            Feed {
                data: FeedData::Ltpc(Ltpc {
                    ltp,
                    ltt: 1,
                    ltq: 1,
                    cp: 100.0,
                }),
                request_mode: RequestMode::Ltpc,
            },
        );
        FeedMessage {
            kind: FeedType::LiveFeed,
            feeds,
            current_ts: 1,
            market_info: None,
        }
    }

    async fn serve(hub: Arc<RelayHub>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(AppState::new(hub));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return text.to_string(),
                _ => continue,
            }
        }
    }

    async fn wait_for_subscribers(hub: &RelayHub, n: usize) {
        for _ in 0..200 {
            if hub.subscriber_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} subscribers, have {}", n, hub.subscriber_count());
    }

    #[tokio::test]
    async fn test_stream_bootstraps_relays_and_answers_ping() {
        let hub = Arc::new(RelayHub::new(HubConfig::default()));
        hub.on_upstream_message(tick(101.0)).await;
        let addr = serve(Arc::clone(&hub)).await;

        let (mut ws, _) = connect_async(format!("ws://{}/stream", addr)).await.unwrap();
        let bootstrap: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(bootstrap["feeds"]["NSE_FO|50979"]["ltpc"]["ltp"], 101.0);

        wait_for_subscribers(&hub, 1).await;
        hub.on_upstream_message(tick(102.0)).await;
        let live: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(live["feeds"]["NSE_FO|50979"]["ltpc"]["ltp"], 102.0);

        ws.send(WsMessage::Text("ping".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "pong");

        hub.on_upstream_closed().await;
        let notice: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(notice["type"], "connection_status");
        assert_eq!(notice["status"], "disconnected");
    }

    #[tokio::test]
    async fn test_stats_endpoint_reports_counters() {
        let hub = Arc::new(RelayHub::new(HubConfig::default()));
        let addr = serve(Arc::clone(&hub)).await;

        let (mut ws, _) = connect_async(format!("ws://{}/stream", addr)).await.unwrap();
        wait_for_subscribers(&hub, 1).await;
        ws.send(WsMessage::Text("hello".into())).await.unwrap();
        for _ in 0..200 {
            if hub.stats().total_messages_received == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats: StatsSnapshot = reqwest::get(format!("http://{}/ws-stats", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats.active_subscribers, 1);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.total_messages_received, 1);
        assert!(!stats.upstream_connected);

        ws.close(None).await.unwrap();
        wait_for_subscribers(&hub, 0).await;
    }

    #[tokio::test]
    async fn test_close_all_ends_subscriber_sockets() {
        let hub = Arc::new(RelayHub::new(HubConfig::default()));
        let addr = serve(Arc::clone(&hub)).await;

        let (mut ws, _) = connect_async(format!("ws://{}/stream", addr)).await.unwrap();
        wait_for_subscribers(&hub, 1).await;
        hub.close_all();

        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    }
}
