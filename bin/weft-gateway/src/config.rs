//! Gateway configuration, loaded from environment variables at startup.

use weft_broker::BrokerKind;

/// Runtime configuration for weft-gateway.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// Broker implementation: `nsq` or `mem` (default: `nsq`).
    pub broker: BrokerKind,
    /// nsqd TCP address to publish to.
    pub broker_host: String,
    pub broker_port: u16,

    /// TLS certificate chain in PEM format; TLS is enabled only when both
    /// `cert_file` and `key_file` are set.
    pub cert_file: Option<String>,
    pub key_file: Option<String>,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,
    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("WEFT_BIND", "0.0.0.0:8000"),
            broker: env_or("WEFT_BROKER", "nsq").parse().unwrap_or(BrokerKind::Nsq),
            broker_host: env_or("WEFT_BROKER_HOST", "nsqd"),
            broker_port: parse_env("WEFT_BROKER_PORT", 4150),
            cert_file: std::env::var("WEFT_CERT_FILE").ok(),
            key_file: std::env::var("WEFT_KEY_FILE").ok(),
            log_level: env_or("WEFT_LOG", "info"),
            log_json: std::env::var("WEFT_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// TLS is on only when both credential files are configured.
    pub fn tls(&self) -> Option<(&str, &str)> {
        match (self.cert_file.as_deref(), self.key_file.as_deref()) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
