use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::{
    alerts::AlertSink,
    collector::{Collector, CollectorState},
    config::Config,
    error::{CollectorError, CollectorResult},
    exchanges,
    persistence::SharedGateway,
};

/// Bound for collector tasks to finish after stop.
const JOIN_TIMEOUT: Duration = Duration::from_secs(15);

/// ============================================================
/// Orchestrator
/// ============================================================
///
/// Owns every collector plus the shared persistence gateway and
/// alert sink.
///
/// Responsibilities:
/// - Build and initialize the enabled collectors (any failure aborts
///   the whole startup, already initialized collectors are stopped)
/// - Run all collectors concurrently until a shutdown signal or until
///   a collector task dies
/// - Stop everything exactly once: collectors, then the gateway,
///   then the alert sink
pub struct Orchestrator {
    config: Config,
    gateway: SharedGateway,
    alerts: AlertSink,
    collectors: Vec<Arc<Collector>>,
    stopped: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: Config, gateway: SharedGateway, alerts: AlertSink) -> Self {
        Self {
            config,
            gateway,
            alerts,
            collectors: Vec::new(),
            stopped: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn collectors(&self) -> &[Arc<Collector>] {
        &self.collectors
    }

    pub async fn init(&mut self) -> CollectorResult<()> {
        self.config.validate()?;

        for ex in self.config.enabled_exchanges() {
            let collector = Arc::new(exchanges::build_collector(
                ex,
                &self.config.alerts,
                self.gateway.clone(),
                self.alerts.clone(),
            )?);

            if let Err(e) = collector.init().await {
                error!("Collector {} failed to initialize: {e}", ex.name);
                for started in &self.collectors {
                    started.stop().await;
                }
                collector.stop().await;
                return Err(e);
            }

            info!("Collector {} initialized", ex.name);
            self.collectors.push(collector);
        }

        if self.collectors.is_empty() {
            warn!("No collectors enabled");
        } else {
            info!("{} collectors ready", self.collectors.len());
        }
        Ok(())
    }

    /// Runs every collector until `shutdown` resolves or a collector
    /// task fails, then stops everything.
    pub async fn start<F>(&self, shutdown: F) -> CollectorResult<()>
    where
        F: Future<Output = ()>,
    {
        self.alerts.start_delivery();

        let mut tasks = JoinSet::new();
        for collector in &self.collectors {
            let collector = collector.clone();
            tasks.spawn(async move {
                let result = collector.start().await;
                (collector.name().to_string(), result)
            });
        }

        let outcome = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
            res = first_failure(&mut tasks) => res,
        };

        self.stop().await;

        match timeout(JOIN_TIMEOUT, async { while tasks.join_next().await.is_some() {} }).await {
            Ok(()) => {}
            Err(_) => {
                warn!("Collector tasks still running after {JOIN_TIMEOUT:?}, aborting");
                tasks.abort_all();
            }
        }

        outcome
    }

    /// Idempotent shutdown of collectors, gateway and alert sink.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping {} collectors", self.collectors.len());

        let mut saved = 0;
        for collector in &self.collectors {
            collector.stop().await;
            if collector.state() != CollectorState::Stopped {
                warn!("Collector {} ended in state {:?}", collector.name(), collector.state());
            }
            saved += collector.stats().total_saved;
        }
        self.gateway.close().await;
        self.alerts.close().await;

        info!("Shutdown complete, {saved} records saved this run");
    }
}

/// Resolves with the first fatal collector failure. Collectors that
/// end normally (only after stop) or with a retryable error are logged
/// and waited past; when every task has ended the future stays pending
/// so the shutdown signal decides.
async fn first_failure(tasks: &mut JoinSet<(String, CollectorResult<()>)>) -> CollectorResult<()> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!("Collector {name} finished"),
            Ok((name, Err(e))) if e.is_fatal() => {
                error!("Collector {name} failed: {e}");
                return Err(e);
            }
            Ok((name, Err(e))) => warn!("Collector {name} ended: {e}"),
            Err(e) => {
                error!("Collector task died: {e}");
                return Err(CollectorError::Internal(e.to_string()));
            }
        }
    }
    std::future::pending().await
}
