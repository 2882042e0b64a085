/// Collector module
///
/// This module groups all logic responsible for:
/// - The collector lifecycle (init, run loop, stop) shared by every exchange
/// - Failure escalation, status reporting and stale-data monitoring
/// - The three collection strategies: polling, streaming, backfill
/// - The normalize -> dedup -> persist pipeline and its async queue
///
/// Design notes:
/// - Exchange-specific logic MUST NOT live here (see `exchanges`)
/// - Strategies observe the shared cancellation token themselves, the
///   core never drops a cycle midway
pub mod backfill;
pub mod backoff;
pub mod lifecycle;
pub mod pipeline;
pub mod polling;
pub mod queue;
pub mod streaming;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    alerts::AlertSink,
    error::CollectorResult,
    persistence::SharedGateway,
    schema::StatusSnapshot,
    util,
};

pub use self::lifecycle::{Collector, CollectorState, CoreSettings};

/// Strategy hooks invoked by the collector core.
///
/// CONTRACT:
/// - `initialize` runs once, before the first `collect_once`
/// - `collect_once` performs one cycle and returns promptly once the
///   context's shutdown token is cancelled
/// - `teardown` releases connections; the core bounds it with a timeout
#[async_trait]
pub trait CollectionStrategy: Send {
    async fn initialize(&mut self) -> CollectorResult<()>;

    async fn collect_once(&mut self) -> CollectorResult<()>;

    async fn teardown(&mut self) -> CollectorResult<()>;
}

// ------------------------------------------------------------
// Collector statistics
// ------------------------------------------------------------
//
// Written by the core (request counters), by pipelines (saved count,
// activity) and by streaming strategies (connected flag). Read by
// the status reporter and the stale monitor. Lock-free.
//
#[derive(Debug)]
pub struct CollectorStats {
    connected: AtomicBool,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_saved: AtomicU64,
    last_activity_ms: AtomicI64,
}

impl Default for CollectorStats {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(false),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_saved: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(util::now_ms()),
        }
    }
}

impl CollectorStats {
    pub fn record_request(&self, ok: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_saved(&self, n: u64) {
        self.total_saved.fetch_add(n, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(util::now_ms(), Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connected: self.is_connected(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            total_saved: self.total_saved.load(Ordering::Relaxed),
            last_activity: util::epoch_to_datetime(self.last_activity_ms())
                .unwrap_or_else(chrono::Utc::now),
        }
    }
}

/// Everything a strategy shares with its collector core.
#[derive(Clone)]
pub struct CollectorContext {
    pub name: String,
    pub stats: Arc<CollectorStats>,
    pub gateway: SharedGateway,
    pub alerts: AlertSink,
    pub shutdown: CancellationToken,
}

impl CollectorContext {
    pub fn new(name: impl Into<String>, gateway: SharedGateway, alerts: AlertSink) -> Self {
        Self {
            name: name.into(),
            stats: Arc::new(CollectorStats::default()),
            gateway,
            alerts,
            shutdown: CancellationToken::new(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alerts::LogTransport;
    use crate::persistence::MemoryGateway;
    use std::time::Duration;

    /// Context over an in-memory gateway with log-only alerts.
    pub(crate) fn memory_context(name: &str) -> (CollectorContext, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        let alerts = AlertSink::new(Arc::new(LogTransport), Duration::from_secs(300));
        (CollectorContext::new(name, gateway.clone(), alerts), gateway)
    }

    #[test]
    fn request_counters_and_error_rate() {
        let stats = CollectorStats::default();
        stats.record_request(true);
        stats.record_request(false);
        stats.record_request(false);
        stats.add_saved(7);

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successful_requests, 1);
        assert_eq!(snap.failed_requests, 2);
        assert_eq!(snap.total_saved, 7);
        assert!((snap.error_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!(!snap.connected);
    }
}
