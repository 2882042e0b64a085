use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------
// Trade direction
// ------------------------------------------------------------
//
// Every exchange encodes the aggressor side differently
// ("buy"/"sell", "Buy"/"Sell", 1/-1). Normalizers map those codes
// onto this enum; storage writes the lowercase form.
//
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }

    /// Parses textual side codes, case-insensitive.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" | "b" | "bid" => Some(Direction::Buy),
            "sell" | "s" | "ask" => Some(Direction::Sell),
            _ => None,
        }
    }
}

// ------------------------------------------------------------
// Canonical trade record
// ------------------------------------------------------------
//
// The exchange-agnostic representation every trade normalizer
// produces. The natural key is `trade_id`; uniqueness is
// exchange-scoped, so each exchange writes to its own tables.
//
// Only `trade_id` and `instrument_name` are guaranteed. Every numeric
// field is optional: a value that fails to parse is stored as NULL
// instead of dropping the trade.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Exchange-assigned identifier (natural key)
    pub trade_id: String,

    /// Canonical instrument name: CURRENCY-DDMMMYY-STRIKE-TYPE
    pub instrument_name: String,

    pub price: Option<f64>,

    /// Size in exchange contracts
    pub contracts: Option<f64>,

    /// Size in underlying (or quote for Binance) units
    pub amount: Option<f64>,

    pub direction: Option<Direction>,

    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
    pub iv: Option<f64>,

    // Block trade fields (Deribit, Bybit)
    pub block_trade_id: Option<String>,
    pub block_trade_leg_count: Option<i32>,
    pub combo_id: Option<String>,
    pub combo_trade_id: Option<String>,

    // Deribit-only extras, kept when present
    pub trade_seq: Option<i64>,
    pub tick_direction: Option<i32>,
    pub liquidation: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl Trade {
    /// Minimal record: identity plus timestamp, everything else empty.
    pub fn new(
        trade_id: impl Into<String>,
        instrument_name: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id: trade_id.into(),
            instrument_name: instrument_name.into(),
            price: None,
            contracts: None,
            amount: None,
            direction: None,
            mark_price: None,
            index_price: None,
            iv: None,
            block_trade_id: None,
            block_trade_leg_count: None,
            combo_id: None,
            combo_trade_id: None,
            trade_seq: None,
            tick_direction: None,
            liquidation: None,
            timestamp,
        }
    }

    pub fn is_block_trade(&self) -> bool {
        self.block_trade_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }
}

// ------------------------------------------------------------
// Canonical candle record
// ------------------------------------------------------------
//
// Natural key: (open_time, interval, exchange, symbol).
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in milliseconds since Unix epoch
    pub open_time: i64,

    /// Interval code, e.g. "1h"
    pub interval: String,

    pub exchange: String,

    /// Exchange symbol, e.g. "BTCUSDT"
    pub symbol: String,

    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,

    pub close_time: Option<i64>,
    pub quote_asset_volume: Option<f64>,
    pub number_of_trades: Option<i64>,
    pub taker_buy_base_volume: Option<f64>,
    pub taker_buy_quote_volume: Option<f64>,

    /// `open_time` as an absolute time
    pub timestamp: DateTime<Utc>,
}

// ------------------------------------------------------------
// Collector status snapshot
// ------------------------------------------------------------
//
// Point-in-time copy of a collector's statistics. Produced by the
// collector core, consumed by the alert sink (status channel) and
// by shutdown logging.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_saved: u64,
    pub last_activity: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Fraction of failed requests, 0.0 when nothing was attempted yet.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parses_exchange_spellings() {
        assert_eq!(Direction::parse("Buy"), Some(Direction::Buy));
        assert_eq!(Direction::parse("SELL"), Some(Direction::Sell));
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn empty_block_trade_id_is_not_a_block_trade() {
        let mut t = Trade::new("1", "BTC-29MAR24-60000-C", Utc::now());
        assert!(!t.is_block_trade());
        t.block_trade_id = Some(String::new());
        assert!(!t.is_block_trade());
        t.block_trade_id = Some("BLOCK-1".into());
        assert!(t.is_block_trade());
    }

    #[test]
    fn error_rate_handles_zero_requests() {
        let s = StatusSnapshot {
            connected: false,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            total_saved: 0,
            last_activity: Utc::now(),
        };
        assert_eq!(s.error_rate(), 0.0);
    }
}
