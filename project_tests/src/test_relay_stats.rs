use clap::Parser;
use relay_common::core::StatsSnapshot;
use relay_common::retrieve::ApiClient;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Polls the relay stats endpoint", long_about = None)]
struct Args {
    /// Relay base URL
    #[clap(short, long, default_value = "http://localhost:4000/")]
    base_url: String,

    /// Seconds between polls
    #[clap(short, long, default_value_t = 5)]
    interval_seconds: u64,

    /// Number of polls (0 polls until Ctrl-C)
    #[clap(short, long, default_value_t = 0)]
    count: u64,
}

fn print_delta(prev: Option<&StatsSnapshot>, current: &StatsSnapshot, interval: Duration) {
    let rate = |now: u64, before: Option<u64>| match before {
        Some(b) => format!("{:.1}/s", now.saturating_sub(b) as f64 / interval.as_secs_f64()),
        None => "-".to_string(),
    };
    println!(
        "[{}] active={} connections={} received={} sent={} ({}) upstream={}",
        chrono::Local::now().format("%H:%M:%S"),
        current.active_subscribers,
        current.total_connections,
        current.total_messages_received,
        current.total_messages_sent,
        rate(current.total_messages_sent, prev.map(|p| p.total_messages_sent)),
        if current.upstream_connected { "up" } else { "down" },
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = ApiClient::new(&args.base_url, None)?;
    let interval = Duration::from_secs(args.interval_seconds.max(1));
    let mut ticker = tokio::time::interval(interval);
    let mut previous: Option<StatsSnapshot> = None;
    let mut polls = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        let resp = client.get::<StatsSnapshot>("ws-stats").await?;
        if !resp.success {
            eprintln!("Stats request failed: {}", resp.failure_summary());
        } else if let Some(stats) = resp.data {
            print_delta(previous.as_ref(), &stats, interval);
            previous = Some(stats);
        }

        polls += 1;
        if args.count > 0 && polls >= args.count {
            break;
        }
    }
    Ok(())
}
