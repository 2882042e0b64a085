use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};

use crate::{
    alerts::AlertLevel,
    config::{AlertConfig, ExchangeConfig},
    error::{CollectorError, CollectorResult, ErrorClass},
    schema::StatusSnapshot,
    util,
};

use super::{CollectionStrategy, CollectorContext, pipeline::report_persistence_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Created,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Timing and escalation thresholds of one collector.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    /// Pause between cycles
    pub interval: Duration,
    pub status_interval: Duration,
    pub stale_check_interval: Duration,
    pub stale_after: Duration,

    /// Consecutive failed cycles before a connection alert
    pub error_streak_threshold: u32,

    /// High-error-rate alert needs more requests than this...
    pub error_rate_min_requests: u64,
    /// ...and a failure rate above this
    pub error_rate_threshold: f64,

    /// Bound for background task shutdown and strategy teardown
    pub shutdown_timeout: Duration,
}

impl CoreSettings {
    pub fn from_config(ex: &ExchangeConfig, alerts: &AlertConfig) -> Self {
        Self {
            interval: ex.interval(),
            status_interval: Duration::from_secs(alerts.status_interval_secs),
            stale_check_interval: Duration::from_secs(alerts.stale_check_interval_secs),
            stale_after: Duration::from_secs(alerts.stale_after_secs),
            ..Self::default()
        }
    }
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            status_interval: Duration::from_secs(60),
            stale_check_interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(600),
            error_streak_threshold: 5,
            error_rate_min_requests: 20,
            error_rate_threshold: 0.5,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Minutes of silence, if `now - last_activity` exceeds `threshold`.
pub fn stale_minutes(last_activity_ms: i64, now_ms: i64, threshold: Duration) -> Option<i64> {
    let silent = now_ms - last_activity_ms;
    (silent > threshold.as_millis() as i64).then_some(silent / 60_000)
}

/// ============================================================
/// Collector
/// ============================================================
///
/// Lifecycle shared by every exchange:
///
///   Created -> Initializing -> Running -> Stopping -> Stopped
///                   |
///                   +-> Failed (initialization error)
///
/// Responsibilities:
/// - Run the strategy's `collect_once` in a loop, one interval apart
/// - Count requests per cycle and escalate repeated failures
/// - Push periodic status snapshots
/// - Raise "no data" alerts when nothing was collected for a while
/// - Stop cooperatively: cancel, join background tasks, tear down,
///   each step bounded by a timeout
///
/// Cycle failures never leave the loop; only `stop` ends it.
pub struct Collector {
    ctx: CollectorContext,
    settings: CoreSettings,
    strategy: Mutex<Box<dyn CollectionStrategy>>,
    state: StdMutex<CollectorState>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(ctx: CollectorContext, settings: CoreSettings, strategy: Box<dyn CollectionStrategy>) -> Self {
        Self {
            ctx,
            settings,
            strategy: Mutex::new(strategy),
            state: StdMutex::new(CollectorState::Created),
            background: StdMutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn state(&self) -> CollectorState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(CollectorState::Failed)
    }

    fn set_state(&self, next: CollectorState) {
        if let Ok(mut s) = self.state.lock() {
            *s = next;
        }
    }

    /// Moves `from -> to` atomically; returns the state found otherwise.
    fn transition(&self, from: CollectorState, to: CollectorState) -> Result<(), CollectorState> {
        let Ok(mut s) = self.state.lock() else {
            return Err(CollectorState::Failed);
        };
        if *s != from {
            return Err(*s);
        }
        *s = to;
        Ok(())
    }

    pub fn stats(&self) -> StatusSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Runs the strategy's initialization. On error the collector is
    /// marked Failed and must not be started.
    pub async fn init(&self) -> CollectorResult<()> {
        self.transition(CollectorState::Created, CollectorState::Initializing)
            .map_err(|s| CollectorError::Configuration(format!("{}: init in state {s:?}", self.ctx.name)))?;

        info!("[{}] initializing", self.ctx.name);
        let result = self.strategy.lock().await.initialize().await;

        match &result {
            Ok(()) => {
                self.ctx.alerts.notify(
                    AlertLevel::Info,
                    &self.ctx.name,
                    format!("{} initialized", self.ctx.name),
                    &format!("{}:initialized", self.ctx.name),
                    Some(Duration::ZERO),
                );
            }
            Err(e) => {
                error!("[{}] initialization failed: {e}", self.ctx.name);
                self.set_state(CollectorState::Failed);
            }
        }
        result
    }

    /// Runs the collection loop until [`stop`](Self::stop).
    pub async fn start(&self) -> CollectorResult<()> {
        self.transition(CollectorState::Initializing, CollectorState::Running)
            .map_err(|s| CollectorError::Configuration(format!("{}: start in state {s:?}", self.ctx.name)))?;

        self.ctx.stats.touch();
        let reporter = self.spawn_status_reporter();
        let monitor = self.spawn_stale_monitor();
        if let Ok(mut bg) = self.background.lock() {
            bg.push(reporter);
            bg.push(monitor);
        }

        info!("[{}] started", self.ctx.name);
        self.ctx.alerts.notify(
            AlertLevel::Success,
            &self.ctx.name,
            format!("{} started", self.ctx.name),
            &format!("{}:started", self.ctx.name),
            Some(Duration::ZERO),
        );

        self.run_loop().await;
        Ok(())
    }

    async fn run_loop(&self) {
        let shutdown = self.ctx.shutdown.clone();
        let mut strategy = self.strategy.lock().await;
        let mut streak = 0u32;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let result = strategy.collect_once().await;
            self.ctx.stats.record_request(result.is_ok());

            match result {
                Ok(()) => {
                    streak = 0;
                    self.ctx.stats.touch();
                }
                Err(e) => {
                    streak += 1;
                    self.handle_failure(&e, streak, Instant::now());
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.settings.interval) => {}
            }
        }
    }

    /// Logs a failed cycle and raises whichever alerts apply.
    /// Returns the dedup keys of the alerts that were admitted.
    pub(crate) fn handle_failure(&self, err: &CollectorError, streak: u32, now: Instant) -> Vec<String> {
        let name = &self.ctx.name;
        let mut raised = Vec::new();

        match err.class() {
            ErrorClass::Persistence => report_persistence_error(&self.ctx, err),
            ErrorClass::RateLimit => warn!("[{name}] cycle throttled: {err}"),
            _ => warn!("[{name}] cycle failed ({streak} in a row): {err}"),
        }

        if streak >= self.settings.error_streak_threshold {
            let key = format!("{name}:connection_error");
            if self.ctx.alerts.notify_at(
                AlertLevel::Error,
                name,
                format!("{name}: {streak} consecutive failures, last error: {err}"),
                &key,
                None,
                now,
            ) {
                raised.push(key);
            }
        }

        let snap = self.ctx.stats.snapshot();
        if snap.total_requests > self.settings.error_rate_min_requests
            && snap.error_rate() > self.settings.error_rate_threshold
        {
            let key = format!("{name}:high_error_rate");
            if self.ctx.alerts.notify_at(
                AlertLevel::Warning,
                name,
                format!(
                    "{name}: high error rate {:.0}% ({}/{} requests failed)",
                    snap.error_rate() * 100.0,
                    snap.failed_requests,
                    snap.total_requests
                ),
                &key,
                None,
                now,
            ) {
                raised.push(key);
            }
        }

        raised
    }

    fn spawn_status_reporter(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let every = self.settings.status_interval;

        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tick.tick() => ctx.alerts.update_status(&ctx.name, ctx.stats.snapshot()),
                }
            }
        })
    }

    fn spawn_stale_monitor(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let every = self.settings.stale_check_interval;
        let threshold = self.settings.stale_after;

        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick fires immediately
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if let Some(minutes) = stale_minutes(ctx.stats.last_activity_ms(), util::now_ms(), threshold) {
                            warn!("[{}] no data for {minutes} minutes", ctx.name);
                            ctx.alerts.notify(
                                AlertLevel::Warning,
                                &ctx.name,
                                format!("{}: no data for {minutes} minutes", ctx.name),
                                &format!("{}:no_data", ctx.name),
                                None,
                            );
                        }
                    }
                }
            }
        })
    }

    /// Cooperative shutdown. Safe to call more than once and on a
    /// collector that never started.
    pub async fn stop(&self) {
        let previous = {
            let Ok(mut s) = self.state.lock() else {
                return;
            };
            let prev = *s;
            if matches!(prev, CollectorState::Stopping | CollectorState::Stopped) {
                return;
            }
            *s = CollectorState::Stopping;
            prev
        };

        info!("[{}] stopping", self.ctx.name);
        self.ctx.shutdown.cancel();
        let grace = self.settings.shutdown_timeout;

        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .map(|mut bg| bg.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            if timeout(grace, handle).await.is_err() {
                warn!("[{}] background task did not stop within {grace:?}", self.ctx.name);
            }
        }

        if previous != CollectorState::Created {
            match timeout(grace, self.strategy.lock()).await {
                Ok(mut strategy) => match timeout(grace, strategy.teardown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("[{}] teardown failed: {e}", self.ctx.name),
                    Err(_) => warn!("[{}] teardown timed out", self.ctx.name),
                },
                Err(_) => warn!("[{}] collection loop did not exit within {grace:?}", self.ctx.name),
            }
        }

        self.set_state(CollectorState::Stopped);

        let snap = self.ctx.stats.snapshot();
        let summary = format!(
            "requests={} ok={} failed={} saved={}",
            snap.total_requests, snap.successful_requests, snap.failed_requests, snap.total_saved
        );
        info!("[{}] stopped, final stats: {summary}", self.ctx.name);

        if previous == CollectorState::Running {
            self.ctx.alerts.notify(
                AlertLevel::Warning,
                &self.ctx.name,
                format!("{} stopped ({summary})", self.ctx.name),
                &format!("{}:stopped", self.ctx.name),
                Some(Duration::ZERO),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSink;
    use crate::alerts::tests::RecordingTransport;
    use crate::persistence::MemoryGateway;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails every cycle with the given error class.
    struct Failing {
        cycles: Arc<AtomicU32>,
        persistence: bool,
    }

    #[async_trait]
    impl CollectionStrategy for Failing {
        async fn initialize(&mut self) -> CollectorResult<()> {
            Ok(())
        }

        async fn collect_once(&mut self) -> CollectorResult<()> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.persistence {
                Err(CollectorError::Persistence("disk full".into()))
            } else {
                Err(CollectorError::TransientNetwork("HTTP 503".into()))
            }
        }

        async fn teardown(&mut self) -> CollectorResult<()> {
            Ok(())
        }
    }

    struct Succeeding;

    #[async_trait]
    impl CollectionStrategy for Succeeding {
        async fn initialize(&mut self) -> CollectorResult<()> {
            Ok(())
        }

        async fn collect_once(&mut self) -> CollectorResult<()> {
            Ok(())
        }

        async fn teardown(&mut self) -> CollectorResult<()> {
            Ok(())
        }
    }

    struct BrokenInit;

    #[async_trait]
    impl CollectionStrategy for BrokenInit {
        async fn initialize(&mut self) -> CollectorResult<()> {
            Err(CollectorError::TransientNetwork("database unreachable".into()))
        }

        async fn collect_once(&mut self) -> CollectorResult<()> {
            Ok(())
        }

        async fn teardown(&mut self) -> CollectorResult<()> {
            Ok(())
        }
    }

    fn collector(strategy: Box<dyn CollectionStrategy>) -> (Collector, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let alerts = AlertSink::new(transport.clone(), Duration::from_secs(300));
        let ctx = CollectorContext::new("okx", Arc::new(MemoryGateway::new()), alerts);
        let settings = CoreSettings {
            interval: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(2),
            ..CoreSettings::default()
        };
        (Collector::new(ctx, settings, strategy), transport)
    }

    fn failing(persistence: bool) -> Box<dyn CollectionStrategy> {
        Box::new(Failing {
            cycles: Arc::new(AtomicU32::new(0)),
            persistence,
        })
    }

    #[test]
    fn connection_alert_fires_once_per_cooldown() {
        let (c, _) = collector(failing(false));
        let err = CollectorError::TransientNetwork("HTTP 503".into());
        let t0 = Instant::now();

        for streak in 1..5 {
            assert!(c.handle_failure(&err, streak, t0).is_empty());
        }
        assert_eq!(c.handle_failure(&err, 5, t0), vec!["okx:connection_error".to_string()]);
        assert!(c.handle_failure(&err, 6, t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(
            c.handle_failure(&err, 7, t0 + Duration::from_secs(301)),
            vec!["okx:connection_error".to_string()]
        );
    }

    #[test]
    fn high_error_rate_needs_enough_requests() {
        let (c, _) = collector(failing(false));
        let err = CollectorError::Protocol("bad body".into());
        let t0 = Instant::now();

        for _ in 0..20 {
            c.ctx.stats.record_request(false);
        }
        assert!(c.handle_failure(&err, 1, t0).is_empty());

        c.ctx.stats.record_request(false);
        assert_eq!(c.handle_failure(&err, 1, t0), vec!["okx:high_error_rate".to_string()]);
    }

    #[test]
    fn stale_detection_threshold() {
        let threshold = Duration::from_secs(600);
        assert_eq!(stale_minutes(0, 600_000, threshold), None);
        assert_eq!(stale_minutes(0, 660_000, threshold), Some(11));
    }

    #[tokio::test]
    async fn failing_cycles_keep_the_loop_running() {
        let cycles = Arc::new(AtomicU32::new(0));
        let (c, _) = collector(Box::new(Failing {
            cycles: cycles.clone(),
            persistence: false,
        }));
        let c = Arc::new(c);

        c.init().await.unwrap();
        let runner = tokio::spawn({
            let c = c.clone();
            async move { c.start().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        c.stop().await;
        assert!(runner.await.unwrap().is_ok());

        assert!(cycles.load(Ordering::SeqCst) >= 2);
        assert_eq!(c.state(), CollectorState::Stopped);
        let snap = c.stats();
        assert_eq!(snap.total_requests, snap.failed_requests);
        assert!(snap.total_requests >= 2);
    }

    #[tokio::test]
    async fn persistence_failures_raise_persistence_alert() {
        let (c, transport) = collector(failing(true));
        c.ctx.alerts.start_delivery();
        c.handle_failure(&CollectorError::Persistence("disk full".into()), 1, Instant::now());
        c.ctx.alerts.close().await;
        assert_eq!(transport.alert_keys(), vec!["okx:persistence".to_string()]);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_notifies_once() {
        let (c, transport) = collector(Box::new(Succeeding));
        let c = Arc::new(c);
        c.ctx.alerts.start_delivery();

        c.init().await.unwrap();
        let runner = tokio::spawn({
            let c = c.clone();
            async move { c.start().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        c.stop().await;
        c.stop().await;
        runner.await.unwrap().unwrap();
        c.ctx.alerts.close().await;

        let keys = transport.alert_keys();
        assert_eq!(keys.iter().filter(|k| *k == "okx:started").count(), 1);
        assert_eq!(keys.iter().filter(|k| *k == "okx:stopped").count(), 1);
        assert!(c.stats().successful_requests >= 1);
    }

    #[tokio::test]
    async fn stale_monitor_raises_no_data_alert() {
        let transport = Arc::new(RecordingTransport::default());
        let alerts = AlertSink::new(transport.clone(), Duration::from_secs(300));
        alerts.start_delivery();
        let ctx = CollectorContext::new("okx", Arc::new(MemoryGateway::new()), alerts.clone());
        let settings = CoreSettings {
            interval: Duration::from_millis(5),
            stale_check_interval: Duration::from_millis(10),
            stale_after: Duration::from_millis(1),
            shutdown_timeout: Duration::from_secs(2),
            ..CoreSettings::default()
        };
        // failing cycles never refresh last_activity
        let c = Arc::new(Collector::new(ctx, settings, failing(false)));

        c.init().await.unwrap();
        let runner = tokio::spawn({
            let c = c.clone();
            async move { c.start().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        c.stop().await;
        runner.await.unwrap().unwrap();
        alerts.close().await;

        let keys = transport.alert_keys();
        assert_eq!(keys.iter().filter(|k| *k == "okx:no_data").count(), 1);
        assert!(keys.contains(&"okx:initialized".to_string()));
    }

    #[tokio::test]
    async fn failed_init_marks_collector_failed() {
        let (c, _) = collector(Box::new(BrokenInit));
        assert!(c.init().await.is_err());
        assert_eq!(c.state(), CollectorState::Failed);
        assert!(c.start().await.is_err());
        c.stop().await;
        assert_eq!(c.state(), CollectorState::Stopped);
    }
}
