use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;

use crate::{
    config::ExchangeConfig,
    error::{CollectorError, CollectorResult},
    exchanges::adapter::{PollSource, TimeWindow},
    http, util,
};

use super::{CollectionStrategy, CollectorContext, pipeline::TradePipeline};

/// Fixed-interval REST polling.
///
/// Each cycle asks every partition for the trades of the last
/// interval. Partitions are isolated: one failing group does not
/// prevent the others from being collected. The cycle reports the
/// first failure after all groups ran, so the core still counts it.
pub struct PollingStrategy<S: PollSource + 'static> {
    source: Arc<S>,
    client: Option<Client>,
    partitions: Vec<String>,
    window: Duration,
    seed_keys: i64,
    ctx: CollectorContext,
    pipeline: TradePipeline,
}

impl<S: PollSource + 'static> PollingStrategy<S> {
    pub fn new(source: S, cfg: &ExchangeConfig, ctx: CollectorContext) -> Self {
        let source = Arc::new(source);
        let pipeline = TradePipeline::new(source.clone(), cfg.dedup_capacity, ctx.clone());
        Self {
            source,
            client: None,
            partitions: cfg.partitions(),
            window: cfg.interval(),
            seed_keys: cfg.seed_keys,
            ctx,
            pipeline,
        }
    }

    fn window_ending_now(&self) -> TimeWindow {
        let end_ms = util::now_ms();
        TimeWindow {
            start_ms: end_ms - self.window.as_millis() as i64,
            end_ms,
        }
    }

    async fn poll_group(&self, client: &Client, partition: &str, window: TimeWindow) -> CollectorResult<usize> {
        let raw = self.source.fetch(client, partition, window).await?;
        let saved = self.pipeline.process_batch(partition, &raw).await?;
        if saved > 0 {
            info!("[{}] saved {saved} {partition} trades", self.ctx.name);
        }
        Ok(saved)
    }
}

#[async_trait]
impl<S: PollSource + 'static> CollectionStrategy for PollingStrategy<S> {
    async fn initialize(&mut self) -> CollectorResult<()> {
        if self.partitions.is_empty() {
            return Err(CollectorError::Configuration(format!("{}: no partitions to poll", self.ctx.name)));
        }
        self.client = Some(http::build_client(self.source.user_agent())?);
        self.pipeline.seed(&self.partitions, self.seed_keys).await;
        info!("[{}] REST client ready", self.ctx.name);
        Ok(())
    }

    async fn collect_once(&mut self) -> CollectorResult<()> {
        let Some(client) = self.client.clone() else {
            return Err(CollectorError::Configuration(format!("{}: not initialized", self.ctx.name)));
        };

        let window = self.window_ending_now();
        let shutdown = self.ctx.shutdown.clone();
        let mut first_error: Option<CollectorError> = None;
        let mut any_ok = false;

        for partition in &self.partitions {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                r = self.poll_group(&client, partition, window) => r,
            };
            match result {
                Ok(_) => any_ok = true,
                Err(e) => {
                    warn!("[{}] {partition} poll failed: {e}", self.ctx.name);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.ctx.stats.set_connected(any_ok);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn teardown(&mut self) -> CollectorResult<()> {
        self.client = None;
        self.ctx.stats.set_connected(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::memory_context;
    use crate::exchanges::adapter::TradeNormalizer;
    use crate::schema::Trade;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    /// Scripted source: BTC serves a fixed page, ETH always fails.
    #[derive(Default)]
    struct ScriptedSource {
        windows: Mutex<Vec<TimeWindow>>,
    }

    impl TradeNormalizer for ScriptedSource {
        fn exchange(&self) -> &'static str {
            "deribit"
        }

        fn natural_key(&self, raw: &Value) -> Option<String> {
            util::value_string(raw.get("id"))
        }

        fn normalize(&self, raw: &Value) -> Option<Trade> {
            let id = util::value_string(raw.get("id"))?;
            Some(Trade::new(id, "BTC-29MAR24-60000-C", chrono::Utc::now()))
        }
    }

    #[async_trait]
    impl PollSource for ScriptedSource {
        fn user_agent(&self) -> &'static str {
            "test"
        }

        async fn fetch(&self, _client: &Client, partition: &str, window: TimeWindow) -> CollectorResult<Vec<Value>> {
            self.windows.lock().unwrap().push(window);
            match partition {
                "BTC" => Ok(vec![json!({ "id": "1" }), json!({ "id": "2" })]),
                _ => Err(CollectorError::TransientNetwork("HTTP 503".into())),
            }
        }
    }

    fn config() -> ExchangeConfig {
        serde_json::from_value(json!({
            "name": "deribit",
            "enabled": true,
            "currencies": ["BTC", "ETH"],
            "interval_secs": 60
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn failing_group_does_not_block_others() {
        let (ctx, gw) = memory_context("deribit");
        let mut strategy = PollingStrategy::new(ScriptedSource::default(), &config(), ctx.clone());
        strategy.initialize().await.unwrap();

        let err = strategy.collect_once().await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::TransientNetwork);
        assert_eq!(gw.trades("deribit_btc_trades").len(), 2);
        assert!(ctx.stats.is_connected());

        let windows = strategy.source.windows.lock().unwrap().clone();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].end_ms - windows[0].start_ms, 60_000);
    }

    #[tokio::test]
    async fn collect_before_initialize_is_rejected() {
        let (ctx, _) = memory_context("deribit");
        let mut strategy = PollingStrategy::new(ScriptedSource::default(), &config(), ctx);
        assert!(strategy.collect_once().await.is_err());
    }
}
