use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::{error::ErrorClass, metrics::METRICS};

use super::pipeline::{TradePipeline, report_persistence_error};
use super::CollectorContext;

/// How long a producer waits for queue space before shedding.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Processor wake-up period while the queue is idle, to notice shutdown.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct QueueItem {
    partition: String,
    payload: Value,
}

/// ============================================================
/// TradeQueue
/// ============================================================
///
/// Decouples frame reception from persistence for high-volume
/// streams. The socket reader enqueues raw entries; one background
/// task runs them through the pipeline in FIFO order.
///
/// Design constraints:
/// - Single consumer, so entries from one partition persist in the
///   order they were received
/// - Bounded: a producer waits up to ENQUEUE_TIMEOUT, then the entry
///   is shed and counted (`queue_shed`)
/// - Processing failures are logged and do not stop the consumer
/// - Closing drains what is already queued, bounded by a timeout
/// - Once the collector is shutting down, the processor also exits on
///   its own the first time it finds the queue empty
pub struct TradeQueue {
    tx: Option<mpsc::Sender<QueueItem>>,
    worker: Option<JoinHandle<()>>,
    name: String,
}

impl TradeQueue {
    /// Spawns the processor task.
    pub fn start(pipeline: Arc<TradePipeline>, capacity: usize, ctx: CollectorContext) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let name = ctx.name.clone();
        let worker = tokio::spawn(process_queue(rx, pipeline, ctx));

        info!("[{name}] trade queue started (capacity={capacity})");
        Self {
            tx: Some(tx),
            worker: Some(worker),
            name,
        }
    }

    /// Returns false when the entry was shed.
    pub async fn enqueue(&self, partition: &str, payload: Value) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let item = QueueItem {
            partition: partition.to_string(),
            payload,
        };
        match tx.send_timeout(item, ENQUEUE_TIMEOUT).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                METRICS.queue_shed.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] trade queue full, entry shed", self.name);
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Stops accepting entries and waits for the processor to drain.
    pub async fn close(&mut self, drain_timeout: Duration) {
        let remaining = self
            .tx
            .take()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);

        let Some(mut worker) = self.worker.take() else {
            return;
        };
        debug!("[{}] draining trade queue ({remaining} pending)", self.name);

        match timeout(drain_timeout, &mut worker).await {
            Ok(Ok(())) => info!("[{}] trade queue drained", self.name),
            Ok(Err(e)) => warn!("[{}] trade queue processor failed: {e}", self.name),
            Err(_) => {
                warn!("[{}] trade queue did not drain within {drain_timeout:?}, aborting", self.name);
                worker.abort();
            }
        }
    }
}

async fn process_queue(mut rx: mpsc::Receiver<QueueItem>, pipeline: Arc<TradePipeline>, ctx: CollectorContext) {
    loop {
        let item = match timeout(POLL_INTERVAL, rx.recv()).await {
            Ok(Some(item)) => item,
            // all senders dropped and the buffer is empty
            Ok(None) => break,
            Err(_) if ctx.shutdown.is_cancelled() => break,
            Err(_) => continue,
        };

        if let Err(e) = pipeline.process_one(&item.partition, &item.payload).await {
            if e.class() == ErrorClass::Persistence {
                report_persistence_error(&ctx, &e);
            } else {
                warn!("[{}] queued trade failed: {e}", ctx.name);
            }
        }
    }
    debug!("[{}] trade queue processor finished", ctx.name);
}
