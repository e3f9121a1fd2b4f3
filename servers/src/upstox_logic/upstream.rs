use crate::upstox_logic::config::RelaySettings;
use crate::upstox_logic::state::RelayHub;
use relay_common::core::{
    ReconnectOutcome, ReconnectPolicy, RelayError, UpstreamEvent,
};
use relay_common::ingestors::{UpstoxWssConfig, UpstreamConnector};
use relay_common::markets::upstox::{authorize, FeedMessage, UpstoxDecoder};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 1024;

/// Supervises the upstream leg until shutdown.
///
/// `first_endpoint` is the URI authorized at startup. Later attempts authorize
/// again since the URI is single use. When reconnection is enabled a
/// `ReconnectPolicy` paces the attempts; once it gives up the hub broadcasts
/// the failure and the relay keeps serving the cached snapshot.
pub async fn run(
    settings: Arc<RelaySettings>,
    hub: Arc<RelayHub>,
    first_endpoint: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    let connector = UpstreamConnector::new(
        UpstoxDecoder::new(),
        UpstoxWssConfig {
            subscription: settings.subscription.clone(),
            idle_timeout: settings.idle_timeout,
        },
    );

    let (events_tx, mut events_rx) = mpsc::channel::<UpstreamEvent<FeedMessage>>(EVENT_BUFFER);
    let pump_hub = Arc::clone(&hub);
    let pump = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            pump_hub.handle_upstream(event).await;
        }
    });

    let mut policy = ReconnectPolicy::new(settings.reconnect);
    policy.on_transition(|state| log::info!("Upstream state: {}", state));
    policy.connect();

    let stop = CancellationToken::new();
    let disconnect = policy.disconnect_handle();
    let stop_on_signal = stop.clone();
    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        log::info!("Upstream shutting down...");
        disconnect.disconnect();
        stop_on_signal.cancel();
    });

    let mut endpoint = Some(first_endpoint);
    loop {
        let uri = match endpoint.take() {
            Some(uri) => Some(uri),
            None => {
                let res = tokio::select! {
                    _ = stop.cancelled() => break,
                    res = authorize(&settings.access_token, &settings.authorize_url) => res,
                };
                match res {
                    Ok(uri) => Some(uri),
                    Err(e) => {
                        log::error!("Re-authorization failed: {}", e);
                        None
                    }
                }
            }
        };

        if let Some(uri) = uri {
            let attempt = tokio::select! {
                _ = stop.cancelled() => break,
                res = connector.connect(&uri, connector.subscription()) => res,
            };
            match attempt {
                Ok(conn) => {
                    policy.on_connected();
                    connector.run(conn, &events_tx, &stop).await;
                }
                Err(e) => {
                    log::error!("Upstream connection failed: {}", e);
                    let _ = events_tx.send(UpstreamEvent::Error(RelayError::from(e))).await;
                }
            }
        }

        if stop.is_cancelled() {
            break;
        }
        if !settings.upstream_reconnect {
            log::warn!("Upstream reconnection disabled; serving cached data only.");
            break;
        }

        match policy.after_disconnect().await {
            ReconnectOutcome::Reconnect => continue,
            ReconnectOutcome::Stopped => break,
            ReconnectOutcome::GaveUp(err) => {
                let _ = events_tx.send(UpstreamEvent::Error(err)).await;
                break;
            }
        }
    }

    drop(events_tx);
    if let Err(e) = pump.await {
        log::error!("Upstream event pump failed: {}", e);
    }
    log::info!("Upstream supervisor stopped.");
}
