use anyhow::{Context, Result};
use relay_common::markets::upstox::authorize;
use std::sync::Arc;
use tokio::signal;

mod upstox_logic;
use upstox_logic::state::{AppState, RelayHub};
use upstox_logic::{config, downstream, logger, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = Arc::new(config::load_config().resolve()?);
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    // A failed credential exchange is fatal at startup.
    let endpoint = authorize(&settings.access_token, &settings.authorize_url)
        .await
        .context("Failed to authorize the market data feed; check UPSTOX_ACCESS_TOKEN")?;
    log::info!("Upstox authentication successful");

    let hub = Arc::new(RelayHub::new(settings.hub));
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let upstream_handle = tokio::spawn(upstream::run(
        Arc::clone(&settings),
        Arc::clone(&hub),
        endpoint,
        shutdown_tx.subscribe(),
    ));

    let downstream_handle = tokio::spawn(downstream::run(
        Arc::clone(&settings),
        AppState::new(Arc::clone(&hub)),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    let _ = shutdown_tx.send(());
    // Subscriber writers end once their queues are gone.
    hub.close_all();

    let (upstream_res, downstream_res) = tokio::join!(upstream_handle, downstream_handle);
    if let Err(e) = upstream_res {
        log::error!("Upstream task failed: {}", e);
    }
    match downstream_res {
        Ok(Err(e)) => log::error!("Downstream server error: {:#}", e),
        Err(e) => log::error!("Downstream task failed: {}", e),
        Ok(Ok(())) => {}
    }

    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
