//! Persistence gateway.
//!
//! The relational engine itself (schema, migrations) lives outside this
//! crate. Collectors only see the [`PersistenceGateway`] trait, whose
//! binding contract is insert-if-absent on the natural key: submitting
//! the same trade twice yields one row.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{CollectorError, CollectorResult};
use crate::schema::{Candle, Trade};
use crate::util::is_safe_identifier;

pub type SharedGateway = Arc<dyn PersistenceGateway>;

/// One normalized record addressed to its destination table.
#[derive(Debug, Clone, Copy)]
pub enum Record<'a> {
    Trade { table: &'a str, trade: &'a Trade },
    Candle { table: &'a str, candle: &'a Candle },
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Whether a trade with this natural key is already stored.
    async fn exists(&self, table: &str, trade_id: &str) -> CollectorResult<bool>;

    /// Inserts unless the natural key exists. Returns whether a row was written.
    async fn insert_trade(&self, table: &str, trade: &Trade) -> CollectorResult<bool>;

    /// Inserts unless `(open_time, interval, exchange, symbol)` exists.
    async fn insert_candle(&self, table: &str, candle: &Candle) -> CollectorResult<bool>;

    /// Most recent trade ids, newest first. Used to seed dedup caches.
    async fn recent_keys(&self, table: &str, limit: i64) -> CollectorResult<Vec<String>>;

    /// `MAX(column)` over rows matching every `(column, value)` filter.
    async fn max_column(
        &self,
        table: &str,
        column: &str,
        filter: &[(&str, &str)],
    ) -> CollectorResult<Option<i64>>;

    /// Batched existence query for candle pages.
    async fn existing_open_times(
        &self,
        table: &str,
        interval: &str,
        exchange: &str,
        open_times: &[i64],
    ) -> CollectorResult<HashSet<i64>>;

    async fn close(&self);

    /// Insert-if-absent for either record kind.
    async fn insert_record(&self, record: Record<'_>) -> CollectorResult<bool> {
        match record {
            Record::Trade { table, trade } => self.insert_trade(table, trade).await,
            Record::Candle { table, candle } => self.insert_candle(table, candle).await,
        }
    }
}

fn checked(name: &str) -> CollectorResult<&str> {
    if is_safe_identifier(name) {
        Ok(name)
    } else {
        Err(CollectorError::Persistence(format!("refusing unsafe identifier '{name}'")))
    }
}

// ------------------------------------------------------------
// Postgres gateway
// ------------------------------------------------------------

pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub async fn connect(url: &str, max_connections: u32) -> CollectorResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        info!("Postgres pool ready (max_connections={max_connections})");
        Ok(Self { pool })
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn exists(&self, table: &str, trade_id: &str) -> CollectorResult<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE trade_id = $1 LIMIT 1", checked(table)?);
        let row: Option<i32> = sqlx::query_scalar(&sql)
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_trade(&self, table: &str, trade: &Trade) -> CollectorResult<bool> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                trade_id, instrument_name, price, contracts, amount, direction,
                mark_price, index_price, iv, block_trade_id, block_trade_leg_count,
                combo_id, combo_trade_id, trade_seq, tick_direction, liquidation, timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (trade_id) DO NOTHING
            "#,
            checked(table)?
        );

        let result = sqlx::query(&sql)
            .bind(&trade.trade_id)
            .bind(&trade.instrument_name)
            .bind(trade.price)
            .bind(trade.contracts)
            .bind(trade.amount)
            .bind(trade.direction.map(|d| d.as_str()))
            .bind(trade.mark_price)
            .bind(trade.index_price)
            .bind(trade.iv)
            .bind(trade.block_trade_id.as_deref())
            .bind(trade.block_trade_leg_count)
            .bind(trade.combo_id.as_deref())
            .bind(trade.combo_trade_id.as_deref())
            .bind(trade.trade_seq)
            .bind(trade.tick_direction)
            .bind(trade.liquidation.as_deref())
            .bind(trade.timestamp)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_candle(&self, table: &str, candle: &Candle) -> CollectorResult<bool> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                open_time, open_price, high_price, low_price, close_price,
                volume, close_time, quote_asset_volume, number_of_trades,
                taker_buy_base_asset_volume, taker_buy_quote_asset_volume,
                interval_type, exchange, symbol, timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (open_time, interval_type, exchange, symbol) DO NOTHING
            "#,
            checked(table)?
        );

        let result = sqlx::query(&sql)
            .bind(candle.open_time)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .bind(candle.close_time)
            .bind(candle.quote_asset_volume)
            .bind(candle.number_of_trades)
            .bind(candle.taker_buy_base_volume)
            .bind(candle.taker_buy_quote_volume)
            .bind(&candle.interval)
            .bind(&candle.exchange)
            .bind(&candle.symbol)
            .bind(candle.timestamp)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn recent_keys(&self, table: &str, limit: i64) -> CollectorResult<Vec<String>> {
        let sql = format!(
            "SELECT trade_id::text FROM {} ORDER BY timestamp DESC LIMIT $1",
            checked(table)?
        );
        let keys: Vec<String> = sqlx::query_scalar(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    async fn max_column(
        &self,
        table: &str,
        column: &str,
        filter: &[(&str, &str)],
    ) -> CollectorResult<Option<i64>> {
        let mut sql = format!("SELECT MAX({})::bigint FROM {}", checked(column)?, checked(table)?);
        for (i, (col, _)) in filter.iter().enumerate() {
            let joiner = if i == 0 { " WHERE" } else { " AND" };
            sql.push_str(&format!("{joiner} {} = ${}", checked(col)?, i + 1));
        }

        let mut query = sqlx::query_scalar::<_, Option<i64>>(&sql);
        for (_, value) in filter {
            query = query.bind(*value);
        }
        Ok(query.fetch_one(&self.pool).await?)
    }

    async fn existing_open_times(
        &self,
        table: &str,
        interval: &str,
        exchange: &str,
        open_times: &[i64],
    ) -> CollectorResult<HashSet<i64>> {
        if open_times.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT open_time FROM {} WHERE open_time = ANY($1) AND interval_type = $2 AND exchange = $3",
            checked(table)?
        );
        let rows: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(open_times.to_vec())
            .bind(interval)
            .bind(exchange)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Postgres pool closed");
    }
}

// ------------------------------------------------------------
// In-memory gateway
// ------------------------------------------------------------
//
// Backs demo mode (nothing leaves the process) and the test suite.
// Rows are kept in insertion order so ordering guarantees can be
// asserted.
//

#[derive(Default)]
struct MemTable {
    trades: Vec<Trade>,
    trade_ids: HashSet<String>,
    candles: Vec<Candle>,
    candle_keys: HashSet<(i64, String, String, String)>,
}

#[derive(Default)]
pub struct MemoryGateway {
    tables: Mutex<HashMap<String, MemTable>>,
    fail_writes: AtomicBool,
    fail_seed_reads: AtomicBool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent insert fail with a persistence error.
    #[cfg(test)]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes `recent_keys` fail, as an unreachable database would.
    #[cfg(test)]
    pub fn set_fail_seed_reads(&self, fail: bool) {
        self.fail_seed_reads.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn trades(&self, table: &str) -> Vec<Trade> {
        self.tables
            .lock()
            .map(|t| t.get(table).map(|m| m.trades.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn candles(&self, table: &str) -> Vec<Candle> {
        self.tables
            .lock()
            .map(|t| t.get(table).map(|m| m.candles.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn with_tables<R>(&self, f: impl FnOnce(&mut HashMap<String, MemTable>) -> R) -> CollectorResult<R> {
        let mut guard = self
            .tables
            .lock()
            .map_err(|_| CollectorError::Persistence("memory gateway poisoned".into()))?;
        Ok(f(&mut guard))
    }

    fn check_writable(&self) -> CollectorResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CollectorError::Persistence("write rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn exists(&self, table: &str, trade_id: &str) -> CollectorResult<bool> {
        self.with_tables(|t| t.get(table).is_some_and(|m| m.trade_ids.contains(trade_id)))
    }

    async fn insert_trade(&self, table: &str, trade: &Trade) -> CollectorResult<bool> {
        self.check_writable()?;
        self.with_tables(|t| {
            let m = t.entry(table.to_string()).or_default();
            if !m.trade_ids.insert(trade.trade_id.clone()) {
                return false;
            }
            m.trades.push(trade.clone());
            true
        })
    }

    async fn insert_candle(&self, table: &str, candle: &Candle) -> CollectorResult<bool> {
        self.check_writable()?;
        self.with_tables(|t| {
            let m = t.entry(table.to_string()).or_default();
            let key = (
                candle.open_time,
                candle.interval.clone(),
                candle.exchange.clone(),
                candle.symbol.clone(),
            );
            if !m.candle_keys.insert(key) {
                return false;
            }
            m.candles.push(candle.clone());
            true
        })
    }

    async fn recent_keys(&self, table: &str, limit: i64) -> CollectorResult<Vec<String>> {
        if self.fail_seed_reads.load(Ordering::SeqCst) {
            return Err(CollectorError::Persistence("read rejected".into()));
        }
        self.with_tables(|t| {
            let Some(m) = t.get(table) else {
                return Vec::new();
            };
            let mut rows: Vec<&Trade> = m.trades.iter().collect();
            // newest first; insertion order breaks ties
            rows.reverse();
            rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            rows.into_iter()
                .take(limit.max(0) as usize)
                .map(|r| r.trade_id.clone())
                .collect()
        })
    }

    async fn max_column(
        &self,
        table: &str,
        column: &str,
        filter: &[(&str, &str)],
    ) -> CollectorResult<Option<i64>> {
        if column != "open_time" {
            return Err(CollectorError::Persistence(format!(
                "memory gateway cannot aggregate column '{column}'"
            )));
        }
        self.with_tables(|t| {
            t.get(table).and_then(|m| {
                m.candles
                    .iter()
                    .filter(|c| {
                        filter.iter().all(|(col, val)| match *col {
                            "interval_type" => c.interval == *val,
                            "exchange" => c.exchange == *val,
                            "symbol" => c.symbol == *val,
                            _ => false,
                        })
                    })
                    .map(|c| c.open_time)
                    .max()
            })
        })
    }

    async fn existing_open_times(
        &self,
        table: &str,
        interval: &str,
        exchange: &str,
        open_times: &[i64],
    ) -> CollectorResult<HashSet<i64>> {
        let wanted: HashSet<i64> = open_times.iter().copied().collect();
        self.with_tables(|t| {
            t.get(table)
                .map(|m| {
                    m.candles
                        .iter()
                        .filter(|c| c.interval == interval && c.exchange == exchange)
                        .map(|c| c.open_time)
                        .filter(|ot| wanted.contains(ot))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn trade(id: &str, secs: i64) -> Trade {
        Trade::new(id, "BTC-29MAR24-60000-C", Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[tokio::test]
    async fn repeated_inserts_produce_one_row() {
        let gw = MemoryGateway::new();
        let t = trade("42", 1_700_000_000);
        let mut inserted = 0;
        for _ in 0..5 {
            if gw.insert_trade("deribit_btc_trades", &t).await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(gw.trades("deribit_btc_trades").len(), 1);
        assert!(gw.exists("deribit_btc_trades", "42").await.unwrap());
    }

    #[tokio::test]
    async fn recent_keys_are_newest_first() {
        let gw = MemoryGateway::new();
        gw.insert_trade("t", &trade("a", 10)).await.unwrap();
        gw.insert_trade("t", &trade("b", 30)).await.unwrap();
        gw.insert_trade("t", &trade("c", 20)).await.unwrap();
        let keys = gw.recent_keys("t", 2).await.unwrap();
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn failing_writes_surface_persistence_errors() {
        let gw = MemoryGateway::new();
        gw.set_fail_writes(true);
        let err = gw.insert_trade("t", &trade("a", 10)).await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Persistence);
    }

    #[test]
    fn unsafe_identifiers_are_rejected() {
        assert!(checked("okx_btc_trades").is_ok());
        assert!(checked("x; DROP TABLE y").is_err());
    }
}
