//! Worker configuration, loaded from environment variables at startup.

use std::time::Duration;

use weft_broker::BrokerKind;

/// Runtime configuration for weft-worker.
///
/// Every field has a sensible default so the worker runs out-of-the-box in
/// the platform's docker-compose topology.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local directory for per-task workspaces; must be visible to the
    /// container runtime for bind mounts (default: `/data`).
    pub data_root: String,

    /// Concurrent learn tasks (default: 1).
    pub learn_parallelism: usize,
    /// Concurrent prediction tasks (default: 1).
    pub predict_parallelism: usize,

    /// Wall-clock budget for one learn task (default: 20 min).
    pub learn_timeout: Duration,
    /// Wall-clock budget for one prediction task (default: 20 min).
    pub predict_timeout: Duration,
    /// Wall-clock budget for one container invocation (default: 15 min).
    pub docker_timeout: Duration,
    /// How long in-flight tasks get to finish after a shutdown signal
    /// before they are cancelled (default: 30 s).
    pub drain_deadline: Duration,

    /// Broker implementation: `nsq` or `mem` (default: `nsq`).
    pub broker: BrokerKind,
    /// nsqd address used by the relay's producer.
    pub broker_host: String,
    pub broker_port: u16,
    /// nsqlookupd HTTP endpoints for consumer discovery, comma-separated.
    pub nsqlookupd_urls: Vec<String>,

    /// Run the ingestion relay inside this process (default: true).
    pub relay_enabled: bool,
    /// Relay polling period (default: 5 s).
    pub relay_period: Duration,

    pub storage_host: String,
    pub storage_port: u16,
    pub storage_user: String,
    pub storage_password: String,

    pub ledger_host: String,
    pub ledger_port: u16,
    pub ledger_user: String,
    pub ledger_password: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,bollard=warn"`.
    pub log_level: String,
    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            data_root: env_or("WEFT_DATA_ROOT", "/data"),
            learn_parallelism: parse_env("WEFT_LEARN_PARALLELISM", 1),
            predict_parallelism: parse_env("WEFT_PREDICT_PARALLELISM", 1),
            learn_timeout: Duration::from_secs(parse_env("WEFT_LEARN_TIMEOUT_SECS", 1200)),
            predict_timeout: Duration::from_secs(parse_env("WEFT_PREDICT_TIMEOUT_SECS", 1200)),
            docker_timeout: Duration::from_secs(parse_env("WEFT_DOCKER_TIMEOUT_SECS", 900)),
            drain_deadline: Duration::from_secs(parse_env("WEFT_DRAIN_DEADLINE_SECS", 30)),
            broker: env_or("WEFT_BROKER", "nsq").parse().unwrap_or(BrokerKind::Nsq),
            broker_host: env_or("WEFT_BROKER_HOST", "nsqd"),
            broker_port: parse_env("WEFT_BROKER_PORT", 4150),
            nsqlookupd_urls: env_or("WEFT_NSQLOOKUPD_URLS", "http://nsqlookupd:4161")
                .split(',')
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect(),
            relay_enabled: parse_bool("WEFT_RELAY_ENABLED", true),
            relay_period: Duration::from_secs(parse_env("WEFT_RELAY_PERIOD_SECS", 5)),
            storage_host: env_or("WEFT_STORAGE_HOST", "storage"),
            storage_port: parse_env("WEFT_STORAGE_PORT", 80),
            storage_user: env_or("WEFT_STORAGE_USER", "u"),
            storage_password: env_or("WEFT_STORAGE_PASSWORD", "p"),
            ledger_host: env_or("WEFT_LEDGER_HOST", "orchestrator"),
            ledger_port: parse_env("WEFT_LEDGER_PORT", 80),
            ledger_user: env_or("WEFT_LEDGER_USER", "u"),
            ledger_password: env_or("WEFT_LEDGER_PASSWORD", "p"),
            log_level: env_or("WEFT_LOG", "info"),
            log_json: parse_bool("WEFT_LOG_JSON", false),
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

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}
