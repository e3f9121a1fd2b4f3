use clap::Parser;
use relay_common::clients::{ClientEvent, ClientStatus, RelayClient, RelayClientConfig};
use relay_common::core::ReconnectConfig;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Subscribes to a running relay and prints what arrives", long_about = None)]
struct Args {
    /// Relay stream URL
    #[clap(short, long, default_value = "ws://localhost:4000/stream")]
    url: String,

    /// Seconds between liveness pings (0 disables them)
    #[clap(short, long, default_value_t = 15)]
    ping_seconds: u64,

    /// Stop after this many feed frames (0 runs until Ctrl-C)
    #[clap(short = 'n', long, default_value_t = 0)]
    max_frames: u64,

    /// Reconnect attempts before giving up
    #[clap(long, default_value_t = 5)]
    max_attempts: u32,
}

fn init_logging() -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}] {}",
                chrono::Local::now().format("[%H:%M:%S%.3f]"),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Needed for wss:// relays
    let _ = rustls::crypto::ring::default_provider().install_default();
    init_logging()?;
    let args = Args::parse();

    let client = RelayClient::new(RelayClientConfig {
        url: args.url.clone(),
        reconnect: ReconnectConfig {
            max_attempts: args.max_attempts,
            ..ReconnectConfig::default()
        },
        ping_interval: (args.ping_seconds > 0).then(|| Duration::from_secs(args.ping_seconds)),
    });
    let disconnect = client.disconnect_handle();
    let mut status = client.status();
    let (tx, mut rx) = mpsc::channel(256);
    let runner = tokio::spawn(client.run(tx));

    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current: ClientStatus = *status.borrow_and_update();
            log::info!("Status: {:?}", current);
        }
    });

    let mut frames = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-C received, disconnecting.");
                disconnect.disconnect();
                break;
            }
            event = rx.recv() => match event {
                Some(ClientEvent::Feed(feed)) => {
                    frames += 1;
                    match feed.first_quote() {
                        Some(q) => log::info!(
                            "#{} {} ltp={} prevClose={} change={}",
                            frames,
                            q.instrument_key,
                            q.ltp,
                            q.prev_close,
                            q.change_percent
                                .map(|c| format!("{:+.2}%", c))
                                .unwrap_or_else(|| "n/a".to_string())
                        ),
                        None => log::info!("#{} {:?} frame without prices", frames, feed.kind),
                    }
                    if args.max_frames > 0 && frames >= args.max_frames {
                        disconnect.disconnect();
                        break;
                    }
                }
                Some(ClientEvent::Notice(notice)) => {
                    log::warn!("Relay notice: {:?} {}", notice.status, notice.message);
                }
                Some(ClientEvent::Pong) => log::debug!("pong"),
                Some(ClientEvent::Connected) => log::info!("Connected to {}", args.url),
                Some(ClientEvent::Disconnected) => log::warn!("Disconnected from {}", args.url),
                None => break,
            }
        }
    }

    match runner.await? {
        Ok(()) => log::info!("Client stopped after {} feed frames.", frames),
        Err(e) => log::error!("Client gave up: {}", e),
    }
    Ok(())
}
