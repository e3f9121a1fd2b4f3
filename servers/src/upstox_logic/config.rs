use anyhow::{bail, Context, Result};
use clap::Parser;
use relay_common::core::{HubConfig, ReconnectConfig};
use relay_common::markets::upstox::{FeedMode, SubscriptionSpec, DEFAULT_AUTHORIZE_URL};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "server_upstox.conf";
pub const DEFAULT_INSTRUMENT: &str = "NSE_FO|50979";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Upstox market data WebSocket relay", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PORT", help = "Port to listen on for subscriber connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "UPSTOX_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "UPSTOX_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "UPSTOX_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "UPSTOX_ACCESS_TOKEN", hide_env_values = true, help = "Upstox API access token.")]
    pub access_token: Option<String>,

    #[clap(long, env = "UPSTOX_AUTHORIZE_URL", help = "Market data feed authorize endpoint.")]
    pub authorize_url: Option<String>,

    #[clap(long, env = "UPSTOX_INSTRUMENT_KEYS", value_delimiter = ',', help = "Comma separated instrument keys to subscribe to.")]
    pub instrument_keys: Option<Vec<String>>,

    #[clap(long, env = "UPSTOX_FEED_MODE", help = "Feed mode (ltpc, full, option_greeks, full_d30).")]
    pub feed_mode: Option<String>,

    #[clap(long, env = "UPSTOX_UPSTREAM_RECONNECT", help = "Reconnect the upstream feed after it drops (true/false).")]
    pub upstream_reconnect: Option<bool>,

    #[clap(long, env = "UPSTOX_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "UPSTOX_RECONNECT_MAX_ATTEMPTS", help = "Reconnect attempts before giving up.")]
    pub reconnect_max_attempts: Option<u32>,

    #[clap(long, env = "UPSTOX_RECONNECT_MAX_DELAY_MS", help = "Upper bound in milliseconds for a single reconnect delay.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "UPSTOX_IDLE_TIMEOUT_SECONDS", help = "Seconds without upstream frames before the session counts as dead.")]
    pub idle_timeout_seconds: Option<u64>,

    #[clap(long, env = "UPSTOX_SEND_TIMEOUT_MS", help = "Milliseconds a subscriber may stall a delivery before eviction.")]
    pub send_timeout_ms: Option<u64>,

    #[clap(long, env = "UPSTOX_QUEUE_CAPACITY", help = "Outbound frames buffered per subscriber.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            access_token: other.access_token.or(self.access_token),
            authorize_url: other.authorize_url.or(self.authorize_url),
            instrument_keys: other.instrument_keys.or(self.instrument_keys),
            feed_mode: other.feed_mode.or(self.feed_mode),
            upstream_reconnect: other.upstream_reconnect.or(self.upstream_reconnect),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            idle_timeout_seconds: other.idle_timeout_seconds.or(self.idle_timeout_seconds),
            send_timeout_ms: other.send_timeout_ms.or(self.send_timeout_ms),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(4000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            authorize_url: Some(DEFAULT_AUTHORIZE_URL.to_string()),
            instrument_keys: Some(vec![DEFAULT_INSTRUMENT.to_string()]),
            feed_mode: Some("full".to_string()),
            upstream_reconnect: Some(true),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_attempts: Some(5),
            reconnect_max_delay_ms: Some(60_000),
            idle_timeout_seconds: Some(30),
            send_timeout_ms: Some(5000),
            queue_capacity: Some(256),
            ..Default::default()
        }
    }

    /// Validates the merged configuration into runtime settings.
    pub fn resolve(self) -> Result<RelaySettings> {
        let d = Config::defaults().merge(self);

        let access_token = d
            .access_token
            .filter(|t| !t.trim().is_empty())
            .context("UPSTOX_ACCESS_TOKEN is required")?;

        let instrument_keys: Vec<String> = d
            .instrument_keys
            .unwrap_or_default()
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if instrument_keys.is_empty() {
            bail!("at least one instrument key is required");
        }

        let mode_text = d.feed_mode.unwrap_or_else(|| "full".to_string());
        let mode = mode_text
            .parse::<FeedMode>()
            .map_err(anyhow::Error::msg)?;

        let tls = match (d.tls_cert_path, d.tls_key_path) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => bail!("TLS needs both a certificate and a key path"),
        };

        Ok(RelaySettings {
            port: d.port.unwrap_or(4000),
            log_dir: d.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: d.log_level.unwrap_or_else(|| "info".to_string()),
            access_token,
            authorize_url: d
                .authorize_url
                .unwrap_or_else(|| DEFAULT_AUTHORIZE_URL.to_string()),
            subscription: SubscriptionSpec::new(instrument_keys, mode),
            upstream_reconnect: d.upstream_reconnect.unwrap_or(true),
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(d.reconnect_base_delay_ms.unwrap_or(1000)),
                max_attempts: d.reconnect_max_attempts.unwrap_or(5),
                max_delay: d.reconnect_max_delay_ms.map(Duration::from_millis),
            },
            idle_timeout: Duration::from_secs(d.idle_timeout_seconds.unwrap_or(30).max(1)),
            hub: HubConfig {
                send_timeout: Duration::from_millis(d.send_timeout_ms.unwrap_or(5000)),
                queue_capacity: d.queue_capacity.unwrap_or(256),
            },
            tls,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub access_token: String,
    pub authorize_url: String,
    pub subscription: SubscriptionSpec,
    pub upstream_reconnect: bool,
    pub reconnect: ReconnectConfig,
    pub idle_timeout: Duration,
    pub hub: HubConfig,
    pub tls: Option<TlsPaths>,
}

/// Layers defaults < config file < environment and CLI.
pub fn load_config() -> Config {
    // .env is optional
    let _ = dotenvy::dotenv();
    let cli = Config::parse();
    layer_sources(cli)
}

fn layer_sources(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current = current.merge(file_config);
    }
    current.merge(cli)
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return None;
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&text) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_token() -> Config {
        Config {
            access_token: Some("token".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_resolve() {
        let s = with_token().resolve().unwrap();
        assert_eq!(s.port, 4000);
        assert_eq!(s.subscription.instrument_keys, vec![DEFAULT_INSTRUMENT.to_string()]);
        assert_eq!(s.subscription.mode, FeedMode::Full);
        assert_eq!(s.reconnect.base_delay, Duration::from_millis(1000));
        assert_eq!(s.reconnect.max_attempts, 5);
        assert!(s.upstream_reconnect);
        assert!(s.tls.is_none());
    }

    #[test]
    fn test_missing_token_is_an_error() {
        assert!(Config::default().resolve().is_err());
        let blank = Config {
            access_token: Some("   ".into()),
            ..Default::default()
        };
        assert!(blank.resolve().is_err());
    }

    #[test]
    fn test_half_tls_config_is_rejected() {
        let cfg = Config {
            tls_cert_path: Some(PathBuf::from("cert.pem")),
            ..with_token()
        };
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn test_unknown_feed_mode_is_rejected() {
        let cfg = Config {
            feed_mode: Some("depth".into()),
            ..with_token()
        };
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn test_file_is_overridden_by_cli() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": 5000, "instrumentKeys": ["NSE_INDEX|Nifty 50"], "reconnectMaxAttempts": 3}}"#
        )
        .unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            port: Some(6000),
            access_token: Some("token".into()),
            ..Default::default()
        };
        let merged = layer_sources(cli);

        assert_eq!(merged.port, Some(6000));
        assert_eq!(merged.instrument_keys, Some(vec!["NSE_INDEX|Nifty 50".to_string()]));
        assert_eq!(merged.reconnect_max_attempts, Some(3));
        assert_eq!(merged.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn test_unparseable_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(layer_sources(cli.clone()), Config::defaults().merge(cli));
    }
}
