use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::Value;

use crate::{
    error::{CollectorError, CollectorResult},
    http,
    schema::{Candle, Direction, Trade},
    util,
};

use super::adapter::{CandleSource, Frame, StreamProtocol, TradeNormalizer};

const OPTIONS_STREAM_URL: &str = "wss://nbstream.binance.com/eoptions/stream";
const SPOT_REST_URL: &str = "https://api.binance.com/api/v3/klines";

/// Binance options trade stream adapter
///
/// Binance European options, combined stream endpoint:
/// wss://nbstream.binance.com/eoptions/stream?streams=BTC@trade/ETH@trade
///
/// DESIGN:
/// - Subscriptions are encoded in the URL, no subscribe messages
/// - Frames arrive wrapped as {"stream": "...", "data": {...}},
///   bare trade objects and arrays of them are accepted as well
/// - Side code `S` is -1 for sell, anything else is a buy
pub struct BinanceOptionsAdapter;

fn stream_name(currency: &str) -> String {
    format!("{}@trade", currency.to_uppercase())
}

/// BTC-240329-60000-C -> BTC
fn partition_from_symbol(trade: &Value) -> Option<String> {
    trade.get("s")?
        .as_str()?
        .split('-')
        .next()
        .filter(|c| !c.is_empty())
        .map(|c| c.to_uppercase())
}

fn is_trade_event(v: &Value) -> bool {
    v.get("e").and_then(|e| e.as_str()) == Some("trade")
}

impl TradeNormalizer for BinanceOptionsAdapter {
    fn exchange(&self) -> &'static str {
        "binance"
    }

    fn natural_key(&self, raw: &Value) -> Option<String> {
        util::value_string(raw.get("t"))
    }

    fn normalize(&self, raw: &Value) -> Option<Trade> {
        let trade_id = util::value_string(raw.get("t"))?;
        let symbol = raw.get("s")?.as_str()?;
        if symbol.is_empty() {
            return None;
        }
        let price_raw = raw.get("p")?;

        let timestamp = util::value_i64(raw.get("T"))
            .and_then(util::epoch_to_datetime)
            .unwrap_or_else(Utc::now);

        let price = util::value_f64(Some(price_raw));
        let quantity = util::value_f64(raw.get("q")).map(f64::abs);

        let mut t = Trade::new(trade_id, util::normalize_instrument(symbol), timestamp);
        t.price = price;
        t.contracts = quantity;
        t.amount = quantity.zip(price).map(|(q, p)| q * p);
        t.direction = Some(match util::value_i64(raw.get("S")) {
            Some(-1) => Direction::Sell,
            _ => Direction::Buy,
        });
        Some(t)
    }

    fn accepts(&self, raw: &Value) -> bool {
        raw.get("s")
            .and_then(|v| v.as_str())
            .is_some_and(util::is_option_instrument)
    }
}

impl StreamProtocol for BinanceOptionsAdapter {
    fn ws_url(&self, partitions: &[String]) -> String {
        let streams: Vec<String> = partitions.iter().map(|c| stream_name(c)).collect();
        format!("{OPTIONS_STREAM_URL}?streams={}", streams.join("/"))
    }

    fn subscribe_messages(&self, _partitions: &[String]) -> Vec<Value> {
        Vec::new()
    }

    fn classify(&self, raw: &str) -> Frame {
        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return Frame::Error(format!("malformed frame: {e}")),
        };

        // --------------------------------------------------
        // Combined stream envelope
        // --------------------------------------------------
        if let (Some(stream), Some(data)) = (v.get("stream").and_then(|s| s.as_str()), v.get("data")) {
            let Some(partition) = stream.split('@').next().filter(|c| !c.is_empty()) else {
                return Frame::Error(format!("unexpected stream name {stream}"));
            };
            let entries = match data {
                Value::Array(items) => items.iter().filter(|i| is_trade_event(i)).cloned().collect(),
                obj if is_trade_event(obj) => vec![obj.clone()],
                _ => Vec::new(),
            };
            return Frame::Data {
                partition: partition.to_uppercase(),
                entries,
            };
        }

        // --------------------------------------------------
        // Bare trade event
        // --------------------------------------------------
        if is_trade_event(&v) {
            return match partition_from_symbol(&v) {
                Some(partition) => Frame::Data { partition, entries: vec![v] },
                None => Frame::Error("trade event without symbol".into()),
            };
        }

        if let Some(msg) = v.get("msg").and_then(|m| m.as_str()) {
            return Frame::Error(msg.to_string());
        }

        Frame::Control
    }
}

// ------------------------------------------------------------
// Spot klines (OHLC backfill)
// ------------------------------------------------------------

/// Binance spot `api/v3/klines` as a paginated candle source.
pub struct BinanceKlines;

/// Earliest candle Binance serves per currency.
pub fn earliest_open_time(currency: &str) -> i64 {
    match currency.to_uppercase().as_str() {
        "ETH" => 1_502_928_000_000,
        // BTCUSDT listing, 2017-08-22
        _ => 1_503_360_000_000,
    }
}

/// Parses one kline row:
/// [open_time, open, high, low, close, volume, close_time,
///  quote_volume, trades, taker_base, taker_quote, ignore]
///
/// Rows that are too short or lack an open time yield `None`.
pub fn normalize_kline(row: &Value, interval: &str, symbol: &str) -> Option<Candle> {
    let fields = row.as_array()?;
    if fields.len() < 11 {
        return None;
    }
    let open_time = util::value_i64(fields.first())?;
    let timestamp = util::epoch_to_datetime(open_time)?;

    Some(Candle {
        open_time,
        interval: interval.to_string(),
        exchange: "binance".to_string(),
        symbol: symbol.to_string(),
        open: util::value_f64(fields.get(1)),
        high: util::value_f64(fields.get(2)),
        low: util::value_f64(fields.get(3)),
        close: util::value_f64(fields.get(4)),
        volume: util::value_f64(fields.get(5)),
        close_time: util::value_i64(fields.get(6)),
        quote_asset_volume: util::value_f64(fields.get(7)),
        number_of_trades: util::value_i64(fields.get(8)),
        taker_buy_base_volume: util::value_f64(fields.get(9)),
        taker_buy_quote_volume: util::value_f64(fields.get(10)),
        timestamp,
    })
}

#[async_trait]
impl CandleSource for BinanceKlines {
    fn exchange(&self) -> &'static str {
        "binance"
    }

    fn user_agent(&self) -> &'static str {
        "options-trade-collector/ohlc"
    }

    fn symbol_for(&self, currency: &str) -> String {
        format!("{}USDT", currency.to_uppercase())
    }

    fn earliest_available(&self, currency: &str) -> i64 {
        earliest_open_time(currency)
    }

    async fn fetch_page(
        &self,
        client: &Client,
        symbol: &str,
        interval: &str,
        start_time: i64,
        limit: u32,
    ) -> CollectorResult<Vec<Candle>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("startTime", start_time.to_string()),
            ("limit", limit.min(1000).to_string()),
        ];
        let body = http::get_json(client, SPOT_REST_URL, &params).await?;

        let Some(rows) = body.as_array() else {
            return Err(CollectorError::Protocol(format!("klines for {symbol}: expected array, got {body}")));
        };

        Ok(rows
            .iter()
            .filter_map(|row| normalize_kline(row, interval, symbol))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trade(side: i64) -> Value {
        json!({
            "e": "trade",
            "E": 1711670400500i64,
            "s": "BTC-240329-60000-C",
            "t": "4611686018427387905",
            "p": "1250.0",
            "q": "-0.5",
            "b": 1, "a": 2,
            "T": 1711670400456i64,
            "S": side
        })
    }

    #[test]
    fn normalizes_trade_with_sell_code() {
        let t = BinanceOptionsAdapter.normalize(&trade(-1)).expect("trade");
        assert_eq!(t.instrument_name, "BTC-29MAR24-60000-C");
        assert_eq!(t.direction, Some(Direction::Sell));
        assert_eq!(t.contracts, Some(0.5));
        assert_eq!(t.amount, Some(625.0));
        assert_eq!(t.timestamp.timestamp_millis(), 1_711_670_400_456);

        let b = BinanceOptionsAdapter.normalize(&trade(1)).unwrap();
        assert_eq!(b.direction, Some(Direction::Buy));
    }

    #[test]
    fn combined_stream_url() {
        let url = BinanceOptionsAdapter.ws_url(&["BTC".into(), "ETH".into()]);
        assert_eq!(url, "wss://nbstream.binance.com/eoptions/stream?streams=BTC@trade/ETH@trade");
    }

    #[test]
    fn classifies_envelope_and_bare_events() {
        let wrapped = json!({ "stream": "ETH@trade", "data": trade(1) }).to_string();
        match BinanceOptionsAdapter.classify(&wrapped) {
            Frame::Data { partition, entries } => {
                assert_eq!(partition, "ETH");
                assert_eq!(entries.len(), 1);
            }
            other => panic!("unexpected frame {other:?}"),
        }

        match BinanceOptionsAdapter.classify(&trade(1).to_string()) {
            Frame::Data { partition, .. } => assert_eq!(partition, "BTC"),
            other => panic!("unexpected frame {other:?}"),
        }

        let listed = json!({ "stream": "BTC@trade", "data": [trade(1), { "e": "depth" }, trade(-1)] }).to_string();
        match BinanceOptionsAdapter.classify(&listed) {
            Frame::Data { entries, .. } => assert_eq!(entries.len(), 2),
            other => panic!("unexpected frame {other:?}"),
        }

        assert!(matches!(BinanceOptionsAdapter.classify("not json"), Frame::Error(_)));
    }

    #[test]
    fn parses_kline_rows() {
        let row = json!([
            1503360000000i64, "4000.0", "4100.0", "3900.0", "4050.0", "12.5",
            1503363599999i64, "50000.0", 321, "6.0", "24000.0", "0"
        ]);
        let c = normalize_kline(&row, "1h", "BTCUSDT").expect("candle");
        assert_eq!(c.open_time, 1_503_360_000_000);
        assert_eq!(c.close, Some(4050.0));
        assert_eq!(c.number_of_trades, Some(321));
        assert_eq!(c.exchange, "binance");

        assert!(normalize_kline(&json!([1, 2, 3]), "1h", "BTCUSDT").is_none());
    }

    #[test]
    fn earliest_available_per_currency() {
        assert_eq!(BinanceKlines.earliest_available("btc"), 1_503_360_000_000);
        assert_eq!(BinanceKlines.earliest_available("ETH"), 1_502_928_000_000);
        assert_eq!(BinanceKlines.symbol_for("eth"), "ETHUSDT");
    }
}
