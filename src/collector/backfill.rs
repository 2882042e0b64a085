use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;

use crate::{
    config::ExchangeConfig,
    error::{CollectorError, CollectorResult},
    exchanges::adapter::CandleSource,
    http,
    persistence::Record,
    util,
};

use super::{CollectionStrategy, CollectorContext};

/// Page size while far behind.
pub const CATCH_UP_PAGE: u32 = 250;

/// Page size once near real time.
pub const LIVE_PAGE: u32 = 10;

/// Pause between symbols inside one cycle.
const SYMBOL_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillMode {
    CatchingUp,
    Live,
}

/// Resumable position of one candle series.
///
/// The cursor is the newest persisted `open_time`; the next request
/// starts right after it. The mode starts as catching-up and is only
/// re-evaluated after a page has been fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillCursor {
    last_open_time: i64,
    mode: BackfillMode,
}

impl BackfillCursor {
    pub fn new(last_open_time: i64) -> Self {
        Self {
            last_open_time,
            mode: BackfillMode::CatchingUp,
        }
    }

    pub fn last_open_time(&self) -> i64 {
        self.last_open_time
    }

    pub fn mode(&self) -> BackfillMode {
        self.mode
    }

    pub fn start_time(&self) -> i64 {
        self.last_open_time + 1
    }

    pub fn page_size(&self) -> u32 {
        match self.mode {
            BackfillMode::CatchingUp => CATCH_UP_PAGE,
            BackfillMode::Live => LIVE_PAGE,
        }
    }

    /// Moves past a fetched page and re-evaluates the mode against
    /// the newest open time of that page.
    pub fn advance(&mut self, page_max_open_time: i64, now_ms: i64, live_gap_ms: i64) {
        self.last_open_time = self.last_open_time.max(page_max_open_time);
        self.mode = if now_ms - self.last_open_time < live_gap_ms {
            BackfillMode::Live
        } else {
            BackfillMode::CatchingUp
        };
    }
}

/// Live gap in milliseconds, saturating instead of wrapping.
fn gap_millis(secs: u64) -> i64 {
    i64::try_from(Duration::from_secs(secs).as_millis()).unwrap_or(i64::MAX)
}

struct Series {
    currency: String,
    symbol: String,
    table: String,
    cursor: BackfillCursor,
}

/// Resumable candle backfill.
///
/// INIT:
/// - the cursor of every symbol is recovered from the store
///   (`MAX(open_time)` for this interval and exchange), falling back
///   to the earliest candle the exchange serves
///
/// CYCLE:
/// - one page per symbol starting at `cursor + 1`
/// - rows already stored are filtered with one batched lookup
/// - the cursor advances past the page even when every row was a
///   duplicate, otherwise the same page would be fetched forever
/// - a failure leaves the cursor untouched, the page is retried
pub struct BackfillStrategy<C: CandleSource + 'static> {
    source: Arc<C>,
    client: Option<Client>,
    ctx: CollectorContext,
    interval: String,
    live_gap_ms: i64,
    currencies: Vec<String>,
    series: Vec<Series>,
}

impl<C: CandleSource + 'static> BackfillStrategy<C> {
    pub fn new(source: C, cfg: &ExchangeConfig, ctx: CollectorContext) -> Self {
        Self {
            source: Arc::new(source),
            client: None,
            ctx,
            interval: cfg.kline_interval.clone(),
            live_gap_ms: gap_millis(cfg.live_gap_secs),
            currencies: cfg.partitions(),
            series: Vec::new(),
        }
    }

    async fn recover_cursor(&self, currency: &str, table: &str) -> BackfillCursor {
        let filter = [("interval_type", self.interval.as_str()), ("exchange", self.source.exchange())];
        match self.ctx.gateway.max_column(table, "open_time", &filter).await {
            Ok(Some(last)) => {
                info!("[{}] {currency} resumes after open_time {last}", self.ctx.name);
                BackfillCursor::new(last)
            }
            Ok(None) => {
                info!("[{}] {currency} has no candles yet, starting from listing", self.ctx.name);
                BackfillCursor::new(self.source.earliest_available(currency))
            }
            Err(e) => {
                warn!("[{}] could not read {currency} cursor ({e}), starting from listing", self.ctx.name);
                BackfillCursor::new(self.source.earliest_available(currency))
            }
        }
    }

    /// Fetches and stores one page. Returns the number of new rows.
    async fn collect_series(&mut self, client: &Client, idx: usize) -> CollectorResult<usize> {
        let (symbol, table, start, limit) = {
            let s = &self.series[idx];
            (s.symbol.clone(), s.table.clone(), s.cursor.start_time(), s.cursor.page_size())
        };

        let candles = self
            .source
            .fetch_page(client, &symbol, &self.interval, start, limit)
            .await?;

        let Some(page_max) = candles.iter().map(|c| c.open_time).max() else {
            debug!(
                "[{}] {symbol}: no new candles after {}",
                self.ctx.name,
                self.series[idx].cursor.last_open_time()
            );
            return Ok(0);
        };

        let open_times: Vec<i64> = candles.iter().map(|c| c.open_time).collect();
        let existing = self
            .ctx
            .gateway
            .existing_open_times(&table, &self.interval, self.source.exchange(), &open_times)
            .await?;

        let mut saved = 0;
        for candle in candles.iter().filter(|c| !existing.contains(&c.open_time)) {
            if self
                .ctx
                .gateway
                .insert_record(Record::Candle { table: &table, candle })
                .await?
            {
                saved += 1;
            }
        }

        let series = &mut self.series[idx];
        let before = series.cursor.mode();
        series.cursor.advance(page_max, util::now_ms(), self.live_gap_ms);
        if series.cursor.mode() != before {
            info!("[{}] {symbol} switched to {:?}", self.ctx.name, series.cursor.mode());
        }

        self.ctx.stats.add_saved(saved as u64);
        self.ctx.stats.touch();
        if saved > 0 {
            info!("[{}] {symbol}: saved {saved} candles", self.ctx.name);
        }
        Ok(saved)
    }
}

#[async_trait]
impl<C: CandleSource + 'static> CollectionStrategy for BackfillStrategy<C> {
    async fn initialize(&mut self) -> CollectorResult<()> {
        if self.currencies.is_empty() {
            return Err(CollectorError::Configuration(format!("{}: no currencies to backfill", self.ctx.name)));
        }
        self.client = Some(http::build_client(self.source.user_agent())?);

        let mut series = Vec::with_capacity(self.currencies.len());
        for currency in &self.currencies {
            let table = util::candles_table(currency);
            let cursor = self.recover_cursor(currency, &table).await;
            series.push(Series {
                currency: currency.clone(),
                symbol: self.source.symbol_for(currency),
                table,
                cursor,
            });
        }
        self.series = series;
        Ok(())
    }

    async fn collect_once(&mut self) -> CollectorResult<()> {
        let Some(client) = self.client.clone() else {
            return Err(CollectorError::Configuration(format!("{}: not initialized", self.ctx.name)));
        };

        let shutdown = self.ctx.shutdown.clone();
        let mut first_error: Option<CollectorError> = None;

        for idx in 0..self.series.len() {
            if idx > 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(SYMBOL_DELAY) => {}
                }
            }
            let result = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                r = self.collect_series(&client, idx) => r,
            };
            if let Err(e) = result {
                warn!("[{}] {} backfill failed: {e}", self.ctx.name, self.series[idx].currency);
                first_error.get_or_insert(e);
            }
        }

        self.ctx.stats.set_connected(first_error.is_none());
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
