// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:       Configuration structs loaded from JSON
// - error:        Error taxonomy shared by every collector
// - schema:       Canonical trade / candle / status records
// - util:         Shared helpers (time, instrument names, coercion)
// - dedup:        Bounded per-partition natural-key cache
// - persistence:  Insert-if-absent gateway (Postgres, in-memory)
// - alerts:       Alert sink with cooldowns and status channel
// - http:         Shared REST client helpers
// - exchanges:    Exchange adapters and collector factory
// - collector:    Collector lifecycle and collection strategies
// - orchestrator: Startup, concurrent run, ordered shutdown
// - metrics:      Process-wide runtime counters
//
mod alerts;
mod collector;
mod config;
mod dedup;
mod error;
mod exchanges;
mod http;
mod metrics;
mod orchestrator;
mod persistence;
mod schema;
mod util;

// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::{error, info, warn};
use rustls::crypto::{CryptoProvider, ring};
use tokio::time::sleep;

use alerts::{AlertSink, AlertTransport, LogTransport, RedisTransport};
use config::Config;
use metrics::METRICS;
use orchestrator::Orchestrator;
use persistence::{MemoryGateway, PgGateway, SharedGateway};

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize cryptography backend (rustls) and logging
// - Load and validate configuration
// - Connect persistence and alert transport
// - Run all enabled collectors until SIGINT / SIGTERM
// - Shut down in order: collectors, persistence, alerts
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation. This must be executed exactly once and
    // as early as possible in the process lifecycle.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow!("failed to install rustls CryptoProvider"))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --------------------------------------------------------
    // Load configuration
    //
    // NOTE:
    // - The config file contains the database URL (credentials).
    // - It must not be committed to version control.
    // --------------------------------------------------------
    let path = config_path();
    let config = Config::load(&path)?;
    info!("Configuration loaded from {path}");

    // --------------------------------------------------------
    // Persistence
    // --------------------------------------------------------
    let gateway: SharedGateway = if config.database.demo {
        warn!("Demo mode: trades are kept in memory only");
        Arc::new(MemoryGateway::new())
    } else {
        Arc::new(PgGateway::connect(&config.database.url, config.database.max_connections).await?)
    };

    // --------------------------------------------------------
    // Alert transport
    //
    // Redis is optional; without it alerts are only logged.
    // --------------------------------------------------------
    let transport: Arc<dyn AlertTransport> = match &config.alerts.redis_url {
        Some(url) => match RedisTransport::connect(
            url,
            config.alerts.alert_channel.clone(),
            config.alerts.status_key.clone(),
        )
        .await
        {
            Ok(t) => Arc::new(t),
            Err(e) => {
                warn!("Redis alert transport unavailable ({e}), logging alerts only");
                Arc::new(LogTransport)
            }
        },
        None => Arc::new(LogTransport),
    };
    let alerts = AlertSink::new(transport, Duration::from_secs(config.alerts.cooldown_secs));

    // --------------------------------------------------------
    // Start metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    tokio::spawn(async {
        loop {
            sleep(Duration::from_secs(60)).await;
            info!("[METRICS] {}", METRICS.summary());
        }
    });

    // --------------------------------------------------------
    // Build, initialize and run collectors
    // --------------------------------------------------------
    let mut orchestrator = Orchestrator::new(config, gateway, alerts);

    if let Err(e) = orchestrator.init().await {
        error!("Startup aborted: {e}");
        orchestrator.stop().await;
        return Err(e.into());
    }

    orchestrator.start(shutdown_signal()).await?;
    Ok(())
}

/// First CLI argument, then `COLLECTOR_CONFIG`, then `config.json`.
fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("COLLECTOR_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Ctrl-C handler failed: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("SIGTERM handler failed: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
