use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::error::CollectorResult;
use crate::schema::{Candle, Trade};
use crate::util;

/// Classification of one inbound WebSocket text frame.
///
/// The streaming runtime decides what to do with each variant;
/// adapters only translate.
#[derive(Debug)]
pub enum Frame {
    /// Subscription push: payload entries for one partition
    Data { partition: String, entries: Vec<Value> },

    /// Server heartbeat test request that must be answered immediately
    TestRequest,

    /// Heartbeat acknowledgement / pong, logged only
    Keepalive,

    /// Error frame from the exchange; the stream continues
    Error(String),

    /// Subscription acks and anything else without payload
    Control,
}

/// Inclusive time window in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Pure mapping from a raw exchange trade payload to the canonical record.
///
/// IMPORTANT:
/// - Must NEVER panic on malformed input
/// - Returns `None` only when an identity field is missing
///   (natural key, instrument name, price key)
/// - Unparsable optional numerics become `None` on the record
///
/// THREAD SAFETY:
/// - Must be Send + Sync, instances are shared across tasks
pub trait TradeNormalizer: Send + Sync {
    /// Exchange identifier used for table routing.
    fn exchange(&self) -> &'static str;

    /// Natural key extracted without full normalization, so the dedup
    /// cache can be consulted before doing any work.
    fn natural_key(&self, raw: &Value) -> Option<String>;

    fn normalize(&self, raw: &Value) -> Option<Trade>;

    /// Whether the entry belongs to the tracked instrument class.
    fn accepts(&self, _raw: &Value) -> bool {
        true
    }

    fn trades_table(&self, partition: &str) -> String {
        util::trades_table(self.exchange(), partition)
    }

    /// Secondary table receiving block trades, if the exchange keeps one.
    fn block_trades_table(&self, _partition: &str) -> Option<String> {
        None
    }
}

/// WebSocket push protocol of one exchange.
///
/// Covers connection URL, heartbeat handshake, subscription messages
/// and frame classification. No I/O happens here; the streaming
/// runtime owns the socket.
pub trait StreamProtocol: TradeNormalizer {
    fn ws_url(&self, partitions: &[String]) -> String;

    /// Control message declaring the heartbeat interval, sent right
    /// after connecting. `None` when the exchange has no such handshake.
    fn heartbeat_setup(&self, _interval_secs: u64) -> Option<Value> {
        None
    }

    /// One message per tracked partition.
    fn subscribe_messages(&self, partitions: &[String]) -> Vec<Value>;

    fn unsubscribe_messages(&self, _partitions: &[String]) -> Vec<Value> {
        Vec::new()
    }

    fn classify(&self, raw: &str) -> Frame;

    /// Answer to a [`Frame::TestRequest`].
    fn heartbeat_reply(&self) -> Option<Value> {
        None
    }

    /// Application-level ping the client must send periodically.
    fn client_ping(&self) -> Option<(Duration, &'static str)> {
        None
    }
}

/// REST trade listing polled at a fixed interval.
#[async_trait]
pub trait PollSource: TradeNormalizer {
    fn user_agent(&self) -> &'static str;

    async fn fetch(&self, client: &Client, partition: &str, window: TimeWindow) -> CollectorResult<Vec<Value>>;
}

/// Paginated candle listing used by the backfill strategy.
#[async_trait]
pub trait CandleSource: Send + Sync {
    fn exchange(&self) -> &'static str;

    fn user_agent(&self) -> &'static str;

    /// Exchange symbol for a tracked currency, e.g. BTC -> BTCUSDT.
    fn symbol_for(&self, currency: &str) -> String;

    /// Oldest candle the exchange can serve for this currency.
    fn earliest_available(&self, currency: &str) -> i64;

    /// Candles with `open_time >= start_time`, oldest first, at most `limit`.
    async fn fetch_page(
        &self,
        client: &Client,
        symbol: &str,
        interval: &str,
        start_time: i64,
        limit: u32,
    ) -> CollectorResult<Vec<Candle>>;
}
