use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::CollectorResult;
use crate::schema::StatusSnapshot;

/// Pending deliveries buffered between collectors and the transport.
const DELIVERY_BUFFER: usize = 1024;

/// Upper bound for draining pending deliveries on close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub collector: String,
    pub message: String,
    pub dedup_key: String,
    pub at: DateTime<Utc>,
}

enum Delivery {
    Alert(Alert),
    Status {
        collector: String,
        snapshot: StatusSnapshot,
    },
}

/// Where admitted alerts and status snapshots end up.
///
/// The chat-bot front end reading them is not part of this crate.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn send_alert(&self, alert: &Alert) -> CollectorResult<()>;

    async fn send_status(&self, collector: &str, snapshot: &StatusSnapshot) -> CollectorResult<()>;
}

// ------------------------------------------------------------
// Transports
// ------------------------------------------------------------

/// Writes alerts into the process log. Used when no Redis is configured.
pub struct LogTransport;

#[async_trait]
impl AlertTransport for LogTransport {
    async fn send_alert(&self, alert: &Alert) -> CollectorResult<()> {
        match alert.level {
            AlertLevel::Error => error!("[ALERT] {}: {}", alert.collector, alert.message),
            AlertLevel::Warning => warn!("[ALERT] {}: {}", alert.collector, alert.message),
            AlertLevel::Info | AlertLevel::Success => {
                info!("[ALERT] {}: {}", alert.collector, alert.message)
            }
        }
        Ok(())
    }

    async fn send_status(&self, collector: &str, snapshot: &StatusSnapshot) -> CollectorResult<()> {
        debug!(
            "[STATUS] {} connected={} req={} ok={} failed={} saved={}",
            collector,
            snapshot.connected,
            snapshot.total_requests,
            snapshot.successful_requests,
            snapshot.failed_requests,
            snapshot.total_saved,
        );
        Ok(())
    }
}

/// Publishes alerts on a Redis channel and keeps the latest status
/// of every collector in a Redis hash (one field per collector).
pub struct RedisTransport {
    conn: redis::aio::MultiplexedConnection,
    channel: String,
    status_key: String,
}

impl RedisTransport {
    pub async fn connect(url: &str, channel: String, status_key: String) -> CollectorResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Alert transport connected to Redis (channel={channel})");
        Ok(Self {
            conn,
            channel,
            status_key,
        })
    }
}

#[async_trait]
impl AlertTransport for RedisTransport {
    async fn send_alert(&self, alert: &Alert) -> CollectorResult<()> {
        use redis::AsyncCommands;

        let payload = serde_json::to_string(alert)?;
        let mut conn = self.conn.clone();
        let _: () = conn.publish(&self.channel, payload).await?;
        Ok(())
    }

    async fn send_status(&self, collector: &str, snapshot: &StatusSnapshot) -> CollectorResult<()> {
        use redis::AsyncCommands;

        let payload = serde_json::to_string(snapshot)?;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(&self.status_key, collector, payload).await?;
        Ok(())
    }
}

// ------------------------------------------------------------
// AlertSink
// ------------------------------------------------------------
//
// Shared by every collector. Two responsibilities:
// - cooldown: an identical dedup key is suppressed while its
//   previous firing is younger than the cooldown
// - delivery: admitted alerts are queued for a single background
//   task, so collectors never wait on the transport
//
// The cooldown map is behind a mutex because collectors notify
// concurrently from different tasks.
//

#[derive(Clone)]
pub struct AlertSink {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn AlertTransport>,
    default_cooldown: Duration,
    cooldowns: Mutex<HashMap<String, Instant>>,
    statuses: Mutex<HashMap<String, StatusSnapshot>>,
    tx: Mutex<Option<mpsc::Sender<Delivery>>>,
    rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AlertSink {
    pub fn new(transport: Arc<dyn AlertTransport>, default_cooldown: Duration) -> Self {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        Self {
            inner: Arc::new(Inner {
                transport,
                default_cooldown,
                cooldowns: Mutex::new(HashMap::new()),
                statuses: Mutex::new(HashMap::new()),
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Spawns the delivery task. Calling it again is a no-op.
    pub fn start_delivery(&self) {
        let Some(mut rx) = self.inner.rx.lock().ok().and_then(|mut r| r.take()) else {
            return;
        };
        let transport = self.inner.transport.clone();

        let handle = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let res = match &delivery {
                    Delivery::Alert(alert) => transport.send_alert(alert).await,
                    Delivery::Status { collector, snapshot } => {
                        transport.send_status(collector, snapshot).await
                    }
                };
                if let Err(e) = res {
                    warn!("Alert delivery failed: {e}");
                }
            }
            debug!("Alert delivery task finished");
        });

        if let Ok(mut w) = self.inner.worker.lock() {
            *w = Some(handle);
        }
    }

    /// Sends an alert unless the same `dedup_key` fired within the
    /// cooldown. Returns whether the alert was admitted.
    pub fn notify(
        &self,
        level: AlertLevel,
        collector: &str,
        message: impl Into<String>,
        dedup_key: &str,
        cooldown: Option<Duration>,
    ) -> bool {
        self.notify_at(level, collector, message, dedup_key, cooldown, Instant::now())
    }

    /// [`notify`](Self::notify) with an explicit clock reading.
    pub fn notify_at(
        &self,
        level: AlertLevel,
        collector: &str,
        message: impl Into<String>,
        dedup_key: &str,
        cooldown: Option<Duration>,
        now: Instant,
    ) -> bool {
        let cooldown = cooldown.unwrap_or(self.inner.default_cooldown);

        {
            let Ok(mut map) = self.inner.cooldowns.lock() else {
                return false;
            };
            if let Some(last) = map.get(dedup_key) {
                if now.saturating_duration_since(*last) < cooldown {
                    debug!("Alert '{dedup_key}' suppressed by cooldown");
                    return false;
                }
            }
            map.insert(dedup_key.to_string(), now);
        }

        self.enqueue(Delivery::Alert(Alert {
            level,
            collector: collector.to_string(),
            message: message.into(),
            dedup_key: dedup_key.to_string(),
            at: Utc::now(),
        }));
        true
    }

    /// Last-write-wins status per collector. A flip of the
    /// `connected` flag also raises a lost / restored notification.
    pub fn update_status(&self, collector: &str, snapshot: StatusSnapshot) {
        let previous = self
            .inner
            .statuses
            .lock()
            .ok()
            .and_then(|mut s| s.insert(collector.to_string(), snapshot.clone()));

        if let Some(prev) = previous {
            if prev.connected && !snapshot.connected {
                self.notify(
                    AlertLevel::Error,
                    collector,
                    format!("{collector} lost connection, reconnecting"),
                    &format!("{collector}:connection_lost"),
                    None,
                );
            } else if !prev.connected && snapshot.connected {
                self.notify(
                    AlertLevel::Success,
                    collector,
                    format!("{collector} connection restored, collection resumed"),
                    &format!("{collector}:connection_restored"),
                    None,
                );
            }
        }

        self.enqueue(Delivery::Status {
            collector: collector.to_string(),
            snapshot,
        });
    }

    #[cfg(test)]
    pub fn status(&self, collector: &str) -> Option<StatusSnapshot> {
        self.inner
            .statuses
            .lock()
            .ok()
            .and_then(|s| s.get(collector).cloned())
    }

    fn enqueue(&self, delivery: Delivery) {
        let Ok(guard) = self.inner.tx.lock() else {
            return;
        };
        let Some(tx) = guard.as_ref() else {
            debug!("Alert sink closed, delivery dropped");
            return;
        };
        // Never block a collector on the transport.
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(delivery) {
            warn!("Alert delivery buffer full, dropping");
        }
    }

    /// Stops accepting deliveries and waits (bounded) for the queue to drain.
    pub async fn close(&self) {
        if let Ok(mut tx) = self.inner.tx.lock() {
            tx.take();
        }
        let handle = self.inner.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                warn!("Alert delivery did not drain within {:?}", CLOSE_TIMEOUT);
            }
        }
        info!("Alert sink closed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Transport that keeps everything it receives.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub alerts: Mutex<Vec<Alert>>,
        pub statuses: Mutex<Vec<(String, StatusSnapshot)>>,
    }

    impl RecordingTransport {
        pub fn alert_keys(&self) -> Vec<String> {
            self.alerts
                .lock()
                .unwrap()
                .iter()
                .map(|a| a.dedup_key.clone())
                .collect()
        }
    }

    #[async_trait]
    impl AlertTransport for RecordingTransport {
        async fn send_alert(&self, alert: &Alert) -> CollectorResult<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }

        async fn send_status(&self, collector: &str, snapshot: &StatusSnapshot) -> CollectorResult<()> {
            self.statuses
                .lock()
                .unwrap()
                .push((collector.to_string(), snapshot.clone()));
            Ok(())
        }
    }

    fn snapshot(connected: bool) -> StatusSnapshot {
        StatusSnapshot {
            connected,
            total_requests: 1,
            successful_requests: 1,
            failed_requests: 0,
            total_saved: 0,
            last_activity: Utc::now(),
        }
    }

    #[test]
    fn cooldown_suppresses_repeats_until_expiry() {
        let sink = AlertSink::new(Arc::new(LogTransport), Duration::from_secs(300));
        let t0 = Instant::now();

        assert!(sink.notify_at(AlertLevel::Error, "okx", "down", "okx:conn", None, t0));
        assert!(!sink.notify_at(
            AlertLevel::Error,
            "okx",
            "down",
            "okx:conn",
            None,
            t0 + Duration::from_secs(10)
        ));
        assert!(sink.notify_at(
            AlertLevel::Error,
            "okx",
            "down",
            "okx:conn",
            None,
            t0 + Duration::from_secs(301)
        ));
    }

    #[test]
    fn distinct_keys_do_not_share_cooldown() {
        let sink = AlertSink::new(Arc::new(LogTransport), Duration::from_secs(300));
        let t0 = Instant::now();
        assert!(sink.notify_at(AlertLevel::Error, "a", "x", "a:conn", None, t0));
        assert!(sink.notify_at(AlertLevel::Error, "b", "x", "b:conn", None, t0));
    }

    #[tokio::test]
    async fn close_drains_pending_deliveries() {
        let transport = Arc::new(RecordingTransport::default());
        let sink = AlertSink::new(transport.clone(), Duration::from_secs(300));
        sink.start_delivery();

        sink.notify(AlertLevel::Info, "deribit", "started", "deribit:started", None);
        sink.update_status("deribit", snapshot(true));
        sink.close().await;

        assert_eq!(transport.alert_keys(), vec!["deribit:started".to_string()]);
        assert_eq!(transport.statuses.lock().unwrap().len(), 1);

        // closed sinks drop silently
        sink.notify(AlertLevel::Info, "deribit", "late", "deribit:late", None);
    }

    #[tokio::test]
    async fn connection_flip_raises_notification() {
        let transport = Arc::new(RecordingTransport::default());
        let sink = AlertSink::new(transport.clone(), Duration::from_secs(300));
        sink.start_delivery();

        sink.update_status("okx", snapshot(true));
        sink.update_status("okx", snapshot(false));
        sink.update_status("okx", snapshot(true));
        sink.close().await;

        assert_eq!(
            transport.alert_keys(),
            vec!["okx:connection_lost".to_string(), "okx:connection_restored".to_string()]
        );
        assert_eq!(sink.status("okx").map(|s| s.connected), Some(true));
    }
}
