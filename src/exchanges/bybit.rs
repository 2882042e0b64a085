use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::Value;

use crate::{
    error::{CollectorError, CollectorResult},
    http,
    schema::{Direction, Trade},
    util,
};

use super::adapter::{PollSource, TimeWindow, TradeNormalizer};

const RECENT_TRADES_URL: &str = "https://api.bybit.com/v5/market/recent-trade";

/// Bybit options REST poller
///
/// Bybit V5 market API:
/// https://bybit-exchange.github.io/docs/v5/market/recent-trade
///
/// NOTE:
/// - The endpoint only returns the latest trades (at most 100), the
///   polling window is not forwarded. Overlap between polls is
///   absorbed by the dedup cache and the insert-if-absent store.
/// - Instruments carry a trailing settle coin (BTC-29MAR24-60000-C-USDT)
pub struct BybitPoll;

impl TradeNormalizer for BybitPoll {
    fn exchange(&self) -> &'static str {
        "bybit"
    }

    fn natural_key(&self, raw: &Value) -> Option<String> {
        util::value_string(raw.get("execId"))
    }

    fn normalize(&self, raw: &Value) -> Option<Trade> {
        let exec_id = util::value_string(raw.get("execId"))?;
        let symbol = raw.get("symbol")?.as_str()?;
        if symbol.is_empty() {
            return None;
        }
        let price_raw = raw.get("price")?;

        let timestamp = util::value_i64(raw.get("time"))
            .and_then(util::epoch_to_datetime)
            .unwrap_or_else(Utc::now);

        let price = util::value_f64(Some(price_raw));
        let size = util::value_f64(raw.get("size"));

        let mut t = Trade::new(exec_id.clone(), util::normalize_instrument(symbol), timestamp);
        t.price = price;
        t.contracts = size;
        t.amount = price.zip(size).map(|(p, s)| p * s);
        t.direction = raw
            .get("side")
            .and_then(|v| v.as_str())
            .and_then(Direction::parse);
        t.mark_price = util::value_f64(raw.get("mP"));
        t.index_price = util::value_f64(raw.get("iP"));
        t.iv = util::value_f64(raw.get("iv"));
        if raw.get("isBlockTrade").and_then(|v| v.as_bool()) == Some(true) {
            t.block_trade_id = Some(exec_id);
        }
        Some(t)
    }

    fn accepts(&self, raw: &Value) -> bool {
        raw.get("symbol")
            .and_then(|v| v.as_str())
            .is_some_and(util::is_option_instrument)
    }
}

#[async_trait]
impl PollSource for BybitPoll {
    fn user_agent(&self) -> &'static str {
        "options-trade-collector/bybit"
    }

    async fn fetch(&self, client: &Client, partition: &str, _window: TimeWindow) -> CollectorResult<Vec<Value>> {
        let params = [
            ("category", "option".to_string()),
            ("baseCoin", partition.to_string()),
            ("limit", "100".to_string()),
        ];
        let body = http::get_json(client, RECENT_TRADES_URL, &params).await?;
        extract_list(&body)
    }
}

fn extract_list(body: &Value) -> CollectorResult<Vec<Value>> {
    let ret_code = body.get("retCode").and_then(|c| c.as_i64()).unwrap_or(-1);
    if ret_code != 0 {
        let msg = body.get("retMsg").and_then(|m| m.as_str()).unwrap_or("unknown");
        return Err(CollectorError::Protocol(format!("bybit retCode {ret_code}: {msg}")));
    }
    Ok(body["result"]["list"].as_array().cloned().unwrap_or_default())
}
