use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};

use crate::{
    schema::{Direction, Trade},
    util,
};

use super::adapter::{Frame, StreamProtocol, TradeNormalizer};

/// Contract multiplier of OKX BTC/ETH options (underlying per contract).
const CONTRACT_MULTIPLIER: f64 = 0.01;

/// OKX option-trades WebSocket adapter
///
/// OKX WS v5 public channel:
/// https://www.okx.com/docs-v5/en/#public-data-websocket-option-trades-channel
///
/// DESIGN:
/// - Pure protocol translation
/// - No reconnect logic
/// - One subscription per instrument family ({CUR}-USD)
///
/// NOTE:
/// OKX closes idle connections after 30 seconds, so the client sends
/// a plain-text "ping" every 25 seconds and receives "pong".
pub struct OkxAdapter;

fn inst_family(currency: &str) -> String {
    format!("{}-USD", currency.to_uppercase())
}

fn subscription_arg(currency: &str) -> Value {
    json!({
        "channel": "option-trades",
        "instType": "OPTION",
        "instFamily": inst_family(currency)
    })
}

impl TradeNormalizer for OkxAdapter {
    fn exchange(&self) -> &'static str {
        "okx"
    }

    fn natural_key(&self, raw: &Value) -> Option<String> {
        util::value_string(raw.get("tradeId"))
    }

    fn normalize(&self, raw: &Value) -> Option<Trade> {
        let trade_id = util::value_string(raw.get("tradeId"))?;
        let inst_id = raw.get("instId")?.as_str()?;
        if inst_id.is_empty() {
            return None;
        }
        let price_raw = raw.get("px")?;

        let timestamp = util::value_i64(raw.get("ts"))
            .and_then(util::epoch_to_datetime)
            .unwrap_or_else(Utc::now);

        let size = util::value_f64(raw.get("sz"));

        let mut t = Trade::new(trade_id, util::normalize_instrument(inst_id), timestamp);
        t.price = util::value_f64(Some(price_raw));
        t.contracts = size;
        t.amount = size.map(|sz| sz * CONTRACT_MULTIPLIER);
        t.direction = raw
            .get("side")
            .and_then(|v| v.as_str())
            .and_then(Direction::parse);
        t.mark_price = util::value_f64(raw.get("markPx"));
        t.index_price = util::value_f64(raw.get("idxPx"));
        // fillVol is a fraction, stored as percent like the other venues
        t.iv = util::value_f64(raw.get("fillVol")).map(|v| v * 100.0);
        Some(t)
    }

    fn accepts(&self, raw: &Value) -> bool {
        raw.get("instId")
            .and_then(|v| v.as_str())
            .is_some_and(util::is_option_instrument)
    }
}

impl StreamProtocol for OkxAdapter {
    fn ws_url(&self, _partitions: &[String]) -> String {
        "wss://ws.okx.com:8443/ws/v5/public".to_string()
    }

    fn subscribe_messages(&self, partitions: &[String]) -> Vec<Value> {
        partitions
            .iter()
            .map(|cur| json!({ "op": "subscribe", "args": [subscription_arg(cur)] }))
            .collect()
    }

    fn unsubscribe_messages(&self, partitions: &[String]) -> Vec<Value> {
        let args: Vec<Value> = partitions.iter().map(|c| subscription_arg(c)).collect();
        vec![json!({ "op": "unsubscribe", "args": args })]
    }

    fn classify(&self, raw: &str) -> Frame {
        if raw == "pong" {
            return Frame::Keepalive;
        }

        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return Frame::Error(format!("malformed frame: {e}")),
        };

        // --------------------------------------------------
        // Control / error messages
        // --------------------------------------------------
        if let Some(event) = v.get("event").and_then(|v| v.as_str()) {
            if event == "error" {
                let msg = v.get("msg").and_then(|m| m.as_str()).unwrap_or("unknown");
                let code = v.get("code").and_then(|c| c.as_str()).unwrap_or("-");
                return Frame::Error(format!("okx error {code}: {msg}"));
            }
            return Frame::Control;
        }

        let Some(entries) = v.get("data").and_then(|d| d.as_array()) else {
            return Frame::Control;
        };

        // BTC-USD -> BTC
        let Some(partition) = v["arg"]["instFamily"]
            .as_str()
            .and_then(|f| f.split('-').next())
            .filter(|c| !c.is_empty())
        else {
            return Frame::Error("data frame without instFamily".into());
        };

        Frame::Data {
            partition: partition.to_uppercase(),
            entries: entries.clone(),
        }
    }

    fn client_ping(&self) -> Option<(Duration, &'static str)> {
        Some((Duration::from_secs(25), "ping"))
    }
}
