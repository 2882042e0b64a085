use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::Ordering;

use log::{debug, error, warn};
use serde_json::Value;

use crate::{
    alerts::AlertLevel,
    dedup::DedupCache,
    error::{CollectorError, CollectorResult},
    exchanges::adapter::TradeNormalizer,
    metrics::METRICS,
    persistence::Record,
};

use super::CollectorContext;

/// Normalize -> dedup -> persist for raw trade payloads.
///
/// ORDER OF CHECKS (per entry):
/// 1. instrument filter (`accepts`)
/// 2. natural key present, not in the dedup cache
/// 3. normalization succeeds
/// 4. insert-if-absent into the partition table (and the block table
///    for block trades, when the exchange keeps one)
/// 5. key recorded in the dedup cache
///
/// A key is recorded only after the store accepted it, so a failed
/// insert is retried the next time the trade shows up.
///
/// Partitions whose cache could not be seeded at startup fall back to
/// an `exists` lookup on a cache miss until the key is cached.
///
/// The dedup cache sits behind a std mutex; it is never held across
/// an await point.
pub struct TradePipeline {
    normalizer: Arc<dyn TradeNormalizer>,
    dedup: Mutex<DedupCache>,
    unseeded: Mutex<HashSet<String>>,
    ctx: CollectorContext,
}

impl TradePipeline {
    pub fn new(normalizer: Arc<dyn TradeNormalizer>, dedup_capacity: usize, ctx: CollectorContext) -> Self {
        Self {
            normalizer,
            dedup: Mutex::new(DedupCache::new(dedup_capacity)),
            unseeded: Mutex::new(HashSet::new()),
            ctx,
        }
    }

    /// Loads the most recent persisted keys of every partition.
    ///
    /// A failing partition is logged, starts with an empty cache and
    /// is marked for store lookups on cache misses.
    pub async fn seed(&self, partitions: &[String], limit: i64) {
        for partition in partitions {
            let table = self.normalizer.trades_table(partition);
            match self.ctx.gateway.recent_keys(&table, limit).await {
                Ok(keys) => {
                    let n = keys.len();
                    let cached = match self.dedup.lock() {
                        Ok(mut cache) => {
                            cache.seed(partition, keys);
                            cache.len(partition)
                        }
                        Err(_) => 0,
                    };
                    if let Ok(mut u) = self.unseeded.lock() {
                        u.remove(partition);
                    }
                    debug!("[{}] seeded {partition}: {n} keys loaded, {cached} cached", self.ctx.name);
                }
                Err(e) => {
                    warn!("[{}] could not seed dedup cache for {partition}: {e}", self.ctx.name);
                    if let Ok(mut u) = self.unseeded.lock() {
                        u.insert(partition.clone());
                    }
                }
            }
        }
    }

    fn is_unseeded(&self, partition: &str) -> bool {
        self.unseeded
            .lock()
            .map(|u| u.contains(partition))
            .unwrap_or(false)
    }

    fn seen(&self, partition: &str, key: &str) -> bool {
        self.dedup
            .lock()
            .map(|c| c.seen(partition, key))
            .unwrap_or(false)
    }

    fn remember(&self, partition: &str, key: &str) {
        if let Ok(mut c) = self.dedup.lock() {
            c.record(partition, key);
        }
    }

    /// Processes one raw entry. Returns whether a new row was written
    /// to the primary table.
    pub async fn process_one(&self, partition: &str, raw: &Value) -> CollectorResult<bool> {
        if !self.normalizer.accepts(raw) {
            return Ok(false);
        }

        let Some(key) = self.normalizer.natural_key(raw) else {
            METRICS.normalize_rejects.fetch_add(1, Ordering::Relaxed);
            debug!("[{}] entry without natural key dropped", self.ctx.name);
            return Ok(false);
        };

        if self.seen(partition, &key) {
            METRICS.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let table = self.normalizer.trades_table(partition);
        if self.is_unseeded(partition) && self.ctx.gateway.exists(&table, &key).await? {
            self.remember(partition, &key);
            METRICS.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let Some(trade) = self.normalizer.normalize(raw) else {
            METRICS.normalize_rejects.fetch_add(1, Ordering::Relaxed);
            debug!("[{}] malformed entry {key} dropped", self.ctx.name);
            return Ok(false);
        };
        METRICS.trades_normalized.fetch_add(1, Ordering::Relaxed);

        let inserted = self
            .ctx
            .gateway
            .insert_record(Record::Trade { table: &table, trade: &trade })
            .await?;

        if trade.is_block_trade() {
            if let Some(block_table) = self.normalizer.block_trades_table(partition) {
                self.ctx
                    .gateway
                    .insert_record(Record::Trade { table: &block_table, trade: &trade })
                    .await?;
            }
        }

        self.remember(partition, &key);
        self.ctx.stats.touch();

        if inserted {
            self.ctx.stats.add_saved(1);
            METRICS.records_persisted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(inserted)
    }

    /// Processes entries in order. Stops at the first persistence error;
    /// entries before it stay persisted.
    pub async fn process_batch(&self, partition: &str, entries: &[Value]) -> CollectorResult<usize> {
        let mut saved = 0;
        for raw in entries {
            if self.process_one(partition, raw).await? {
                saved += 1;
            }
        }
        if saved > 0 {
            debug!("[{}] saved {saved} {partition} trades", self.ctx.name);
        }
        Ok(saved)
    }
}

/// Logs a persistence failure and raises the collector's
/// persistence alert (subject to cooldown).
pub fn report_persistence_error(ctx: &CollectorContext, err: &CollectorError) {
    error!("[{}] persistence failure: {err}", ctx.name);
    ctx.alerts.notify(
        AlertLevel::Error,
        &ctx.name,
        format!("{} failed to persist data: {err}", ctx.name),
        &format!("{}:persistence", ctx.name),
        None,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::memory_context;
    use crate::exchanges::deribit::DeribitPoll;
    use serde_json::json;

    fn raw(id: &str) -> Value {
        json!({
            "trade_id": id,
            "instrument_name": "BTC-29MAR24-60000-C",
            "price": 0.05,
            "direction": "sell",
            "timestamp": 1_711_670_400_000i64
        })
    }

    #[tokio::test]
    async fn duplicates_are_skipped_and_counted_once() {
        let (ctx, gw) = memory_context("deribit");
        let pipeline = TradePipeline::new(Arc::new(DeribitPoll), 100, ctx.clone());

        let batch = vec![raw("1"), raw("2"), raw("1")];
        let saved = pipeline.process_batch("BTC", &batch).await.unwrap();
        assert_eq!(saved, 2);
        assert_eq!(gw.trades("deribit_btc_trades").len(), 2);
        assert_eq!(ctx.stats.snapshot().total_saved, 2);

        // second poll returning the same window
        let saved = pipeline.process_batch("BTC", &batch).await.unwrap();
        assert_eq!(saved, 0);
    }

    #[tokio::test]
    async fn block_trades_go_to_both_tables() {
        let (ctx, gw) = memory_context("deribit");
        let pipeline = TradePipeline::new(Arc::new(DeribitPoll), 100, ctx);

        let mut block = raw("B1");
        block["block_trade_id"] = json!("BLK-1");
        pipeline.process_one("BTC", &block).await.unwrap();

        assert_eq!(gw.trades("deribit_btc_trades").len(), 1);
        assert_eq!(gw.trades("deribit_btc_block_trades").len(), 1);
    }

    #[tokio::test]
    async fn seeded_keys_are_skipped() {
        let (ctx, gw) = memory_context("deribit");
        let pipeline = TradePipeline::new(Arc::new(DeribitPoll), 100, ctx);

        pipeline.process_one("BTC", &raw("7")).await.unwrap();

        // fresh pipeline over the same store, seeded at startup
        let (ctx2, _) = memory_context("deribit");
        let ctx2 = CollectorContext { gateway: gw.clone(), ..ctx2 };
        let restarted = TradePipeline::new(Arc::new(DeribitPoll), 100, ctx2);
        restarted.seed(&["BTC".to_string()], 1000).await;
        assert!(restarted.seen("BTC", "7"));
        assert!(!restarted.process_one("BTC", &raw("7")).await.unwrap());
    }

    #[tokio::test]
    async fn unseeded_partition_checks_the_store() {
        let (ctx, gw) = memory_context("deribit");
        let pipeline = TradePipeline::new(Arc::new(DeribitPoll), 100, ctx);
        pipeline.process_one("BTC", &raw("7")).await.unwrap();

        // restart while the store refuses seed reads
        let (ctx2, _) = memory_context("deribit");
        let ctx2 = CollectorContext { gateway: gw.clone(), ..ctx2 };
        let restarted = TradePipeline::new(Arc::new(DeribitPoll), 100, ctx2);
        gw.set_fail_seed_reads(true);
        restarted.seed(&["BTC".to_string()], 1000).await;
        assert!(restarted.is_unseeded("BTC"));
        assert!(!restarted.seen("BTC", "7"));

        // the stored key is found and cached without writing again
        gw.set_fail_writes(true);
        assert!(!restarted.process_one("BTC", &raw("7")).await.unwrap());
        assert!(restarted.seen("BTC", "7"));

        // a later successful seed clears the fallback
        gw.set_fail_seed_reads(false);
        restarted.seed(&["BTC".to_string()], 1000).await;
        assert!(!restarted.is_unseeded("BTC"));
    }

    #[tokio::test]
    async fn failed_insert_is_not_remembered() {
        let (ctx, gw) = memory_context("deribit");
        let pipeline = TradePipeline::new(Arc::new(DeribitPoll), 100, ctx);

        gw.set_fail_writes(true);
        assert!(pipeline.process_one("BTC", &raw("9")).await.is_err());
        assert!(!pipeline.seen("BTC", "9"));

        gw.set_fail_writes(false);
        assert!(pipeline.process_one("BTC", &raw("9")).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_and_foreign_entries_are_dropped() {
        let (ctx, gw) = memory_context("deribit");
        let pipeline = TradePipeline::new(Arc::new(DeribitPoll), 100, ctx);

        let perpetual = json!({ "trade_id": "p", "instrument_name": "BTC-PERPETUAL", "price": 1.0 });
        let no_price = json!({ "trade_id": "n", "instrument_name": "BTC-29MAR24-60000-C" });
        let saved = pipeline.process_batch("BTC", &[perpetual, no_price]).await.unwrap();
        assert_eq!(saved, 0);
        assert!(gw.trades("deribit_btc_trades").is_empty());
    }
}
