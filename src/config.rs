use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use serde::Deserialize;

use crate::error::CollectorError;
use crate::exchanges::SUPPORTED_EXCHANGES;

/// Upper bound for `live_gap_secs` (30 days).
const MAX_LIVE_GAP_SECS: u64 = 30 * 24 * 60 * 60;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from `config.json`.
//
// It defines:
// - Persistence settings
// - Alerting thresholds and delivery
// - Enabled exchanges and their parameters
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    pub exchanges: Vec<ExchangeConfig>,
}

// ------------------------------------------------------------
// Database configuration
// ------------------------------------------------------------
//
// Notes:
// - `url` contains credentials and must not be committed.
// - `demo` swaps Postgres for the in-memory gateway (nothing
//   is written anywhere, useful for local runs).
//
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default)]
    pub demo: bool,
}

// ------------------------------------------------------------
// Alert configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct AlertConfig {
    /// Suppression window for identical alerts
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// How often each collector pushes a status snapshot
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    /// How often the stale-data monitor wakes up
    #[serde(default = "default_stale_check_interval_secs")]
    pub stale_check_interval_secs: u64,

    /// Silence after which a "no data" alert fires
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Optional Redis endpoint; alerts are only logged without it
    pub redis_url: Option<String>,

    #[serde(default = "default_alert_channel")]
    pub alert_channel: String,

    #[serde(default = "default_status_key")]
    pub status_key: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            status_interval_secs: default_status_interval_secs(),
            stale_check_interval_secs: default_stale_check_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            redis_url: None,
            alert_channel: default_alert_channel(),
            status_key: default_status_key(),
        }
    }
}

// ------------------------------------------------------------
// Exchange configuration
// ------------------------------------------------------------
//
// Configuration for a single collector instance. Not every field
// applies to every strategy; unused ones keep their defaults.
//
#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeConfig {
    /// Collector identifier (e.g. "deribit", "okx", "ohlc")
    pub name: String,

    pub enabled: bool,

    /// Tracked instrument groups, e.g. ["BTC", "ETH"]
    #[serde(default)]
    pub currencies: Vec<String>,

    /// Outer loop interval (and polling window)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Keys per partition loaded at init to seed the dedup cache
    #[serde(default = "default_seed_keys")]
    pub seed_keys: i64,

    /// Consecutive failed reconnects before the stream reports failure
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Backfill switches to live mode once the newest candle is
    /// closer than this to now
    #[serde(default = "default_live_gap_secs")]
    pub live_gap_secs: u64,

    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,
}

impl ExchangeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Currencies upper-cased, as used for partitions.
    pub fn partitions(&self) -> Vec<String> {
        self.currencies.iter().map(|c| c.trim().to_uppercase()).collect()
    }
}

fn default_max_connections() -> u32 { 20 }
fn default_cooldown_secs() -> u64 { 300 }
fn default_status_interval_secs() -> u64 { 60 }
fn default_stale_check_interval_secs() -> u64 { 300 }
fn default_stale_after_secs() -> u64 { 600 }
fn default_alert_channel() -> String { "collector:alerts".into() }
fn default_status_key() -> String { "collector:status".into() }
fn default_interval_secs() -> u64 { 60 }
fn default_dedup_capacity() -> usize { 5000 }
fn default_seed_keys() -> i64 { 1000 }
fn default_max_reconnect_attempts() -> u32 { 5 }
fn default_heartbeat_interval_secs() -> u64 { 30 }
fn default_queue_capacity() -> usize { 10_000 }
fn default_live_gap_secs() -> u64 { 2 * 60 * 60 }
fn default_kline_interval() -> String { "1h".into() }

impl Config {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: &str) -> anyhow::Result<Config> {
        let data = fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks semantic constraints serde cannot express.
    ///
    /// All problems are reported together so a broken deployment
    /// can be fixed in one pass.
    pub fn validate(&self) -> Result<(), CollectorError> {
        let mut errors = Vec::new();

        if !self.database.demo && self.database.url.trim().is_empty() {
            errors.push("database.url is required unless database.demo is set".to_string());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be > 0".to_string());
        }
        if self.alerts.status_interval_secs == 0 || self.alerts.stale_check_interval_secs == 0 {
            errors.push("alert intervals must be > 0".to_string());
        }

        let mut seen = HashSet::new();
        for ex in &self.exchanges {
            if !seen.insert(ex.name.as_str()) {
                errors.push(format!("exchange '{}' is configured twice", ex.name));
            }
            if !SUPPORTED_EXCHANGES.contains(&ex.name.as_str()) {
                errors.push(format!("exchange '{}' is not supported", ex.name));
            }
            if !ex.enabled {
                continue;
            }
            if ex.currencies.is_empty() {
                errors.push(format!("exchange '{}' has no currencies", ex.name));
            }
            if ex.currencies.iter().any(|c| {
                c.is_empty() || !c.chars().all(|ch| ch.is_ascii_alphanumeric())
            }) {
                errors.push(format!("exchange '{}' has an invalid currency code", ex.name));
            }
            if ex.interval_secs == 0 {
                errors.push(format!("exchange '{}': interval_secs must be > 0", ex.name));
            }
            if ex.dedup_capacity == 0 || ex.queue_capacity == 0 {
                errors.push(format!("exchange '{}': capacities must be > 0", ex.name));
            }
            if ex.live_gap_secs == 0 || ex.live_gap_secs > MAX_LIVE_GAP_SECS {
                errors.push(format!(
                    "exchange '{}': live_gap_secs must be within 1..={MAX_LIVE_GAP_SECS}",
                    ex.name
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CollectorError::Configuration(errors.join("; ")))
        }
    }

    pub fn enabled_exchanges(&self) -> impl Iterator<Item = &ExchangeConfig> {
        self.exchanges.iter().filter(|e| e.enabled)
    }
}
