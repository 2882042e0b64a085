use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

/// Process-wide runtime counters.
///
/// Purpose:
/// - Track WebSocket activity (frames, reconnects, heartbeats)
/// - Track the normalize -> dedup -> persist funnel
/// - Track queue shedding under backpressure
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update from any task
/// - Per-collector business statistics live in `CollectorStats`,
///   these counters are for operators only
#[derive(Default)]
pub struct RuntimeMetrics {
    // WebSocket level
    pub ws_connections_active: AtomicUsize,
    pub ws_reconnects: AtomicUsize,
    pub frames_received: AtomicUsize,
    pub heartbeat_replies: AtomicUsize,

    // Funnel
    pub trades_normalized: AtomicUsize,
    pub normalize_rejects: AtomicUsize,
    pub duplicates_skipped: AtomicUsize,
    pub records_persisted: AtomicUsize,

    // Queue
    pub queue_shed: AtomicUsize,
}

impl RuntimeMetrics {
    /// One-line summary for the periodic reporter.
    pub fn summary(&self) -> String {
        format!(
            "ws={} reconnects={} frames={} hb_replies={} normalized={} rejects={} dups={} persisted={} shed={}",
            self.ws_connections_active.load(Ordering::Relaxed),
            self.ws_reconnects.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
            self.heartbeat_replies.load(Ordering::Relaxed),
            self.trades_normalized.load(Ordering::Relaxed),
            self.normalize_rejects.load(Ordering::Relaxed),
            self.duplicates_skipped.load(Ordering::Relaxed),
            self.records_persisted.load(Ordering::Relaxed),
            self.queue_shed.load(Ordering::Relaxed),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_mentions_every_counter() {
        let m = RuntimeMetrics::default();
        m.queue_shed.fetch_add(3, Ordering::Relaxed);
        let s = m.summary();
        assert!(s.contains("shed=3"));
        assert!(s.contains("persisted=0"));
    }
}
