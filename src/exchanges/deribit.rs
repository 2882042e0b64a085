use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{Value, json};

use crate::{
    error::{CollectorError, CollectorResult},
    http,
    schema::{Direction, Trade},
    util,
};

use super::adapter::{Frame, PollSource, StreamProtocol, TimeWindow, TradeNormalizer};

const REST_URL: &str = "https://www.deribit.com/api/v2/public/get_last_trades_by_currency_and_time";
const WS_URL: &str = "wss://www.deribit.com/ws/api/v2";

/// Deribit trade normalization, shared by the REST poller and the
/// WebSocket stream (both deliver the same trade object).
///
/// Deribit instrument names are already canonical
/// (BTC-29MAR24-60000-C), fields map 1:1.
fn normalize_trade(raw: &Value) -> Option<Trade> {
    let trade_id = util::value_string(raw.get("trade_id"))?;
    let instrument = raw.get("instrument_name")?.as_str()?;
    if instrument.is_empty() {
        return None;
    }
    // price key is mandatory, its value is coerced defensively
    let price_raw = raw.get("price")?;

    let timestamp = util::value_i64(raw.get("timestamp"))
        .and_then(util::epoch_to_datetime)
        .unwrap_or_else(Utc::now);

    let mut t = Trade::new(trade_id, util::normalize_instrument(instrument), timestamp);
    t.price = util::value_f64(Some(price_raw));
    t.amount = util::value_f64(raw.get("amount"));
    t.contracts = util::value_f64(raw.get("contracts"));
    t.direction = raw
        .get("direction")
        .and_then(|v| v.as_str())
        .and_then(Direction::parse);
    t.mark_price = util::value_f64(raw.get("mark_price"));
    t.index_price = util::value_f64(raw.get("index_price"));
    t.iv = util::value_f64(raw.get("iv"));
    t.block_trade_id = util::value_string(raw.get("block_trade_id"));
    t.block_trade_leg_count = util::value_i64(raw.get("block_trade_leg_count")).map(|v| v as i32);
    t.combo_id = util::value_string(raw.get("combo_id"));
    t.combo_trade_id = util::value_string(raw.get("combo_trade_id"));
    t.trade_seq = util::value_i64(raw.get("trade_seq"));
    t.tick_direction = util::value_i64(raw.get("tick_direction")).map(|v| v as i32);
    t.liquidation = util::value_string(raw.get("liquidation"));
    Some(t)
}

fn is_option(raw: &Value) -> bool {
    raw.get("instrument_name")
        .and_then(|v| v.as_str())
        .is_some_and(util::is_option_instrument)
}

// ------------------------------------------------------------
// REST poller
// ------------------------------------------------------------

/// Polls `public/get_last_trades_by_currency_and_time` for the last
/// interval of every tracked currency.
pub struct DeribitPoll;

impl TradeNormalizer for DeribitPoll {
    fn exchange(&self) -> &'static str {
        "deribit"
    }

    fn natural_key(&self, raw: &Value) -> Option<String> {
        util::value_string(raw.get("trade_id"))
    }

    fn normalize(&self, raw: &Value) -> Option<Trade> {
        normalize_trade(raw)
    }

    fn accepts(&self, raw: &Value) -> bool {
        is_option(raw)
    }

    fn block_trades_table(&self, partition: &str) -> Option<String> {
        Some(util::block_trades_table(self.exchange(), partition))
    }
}

#[async_trait]
impl PollSource for DeribitPoll {
    fn user_agent(&self) -> &'static str {
        "options-trade-collector/deribit"
    }

    async fn fetch(&self, client: &Client, partition: &str, window: TimeWindow) -> CollectorResult<Vec<Value>> {
        let params = [
            ("currency", partition.to_string()),
            ("start_timestamp", window.start_ms.to_string()),
            ("end_timestamp", window.end_ms.to_string()),
            ("count", "1000".to_string()),
            ("include_old", "false".to_string()),
        ];
        let body = http::get_json(client, REST_URL, &params).await?;
        extract_rest_trades(&body)
    }
}

fn extract_rest_trades(body: &Value) -> CollectorResult<Vec<Value>> {
    if let Some(err) = body.get("error") {
        return Err(CollectorError::Protocol(format!("deribit error: {err}")));
    }
    Ok(body
        .get("result")
        .and_then(|r| r.get("trades"))
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default())
}

// ------------------------------------------------------------
// WebSocket stream
// ------------------------------------------------------------

/// Deribit JSON-RPC over WebSocket.
///
/// PROTOCOL:
/// - `public/set_heartbeat` declares the heartbeat interval
/// - one `public/subscribe` per currency: trades.option.{CUR}.100ms
/// - server `heartbeat` frames of type `test_request` must be answered
///   with `public/test`, otherwise the server drops the connection
pub struct DeribitStream;

fn channel_for(currency: &str) -> String {
    format!("trades.option.{}.100ms", currency.to_uppercase())
}

/// trades.option.BTC.100ms -> BTC
fn partition_from_channel(channel: &str) -> Option<String> {
    let mut parts = channel.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("trades"), Some(_kind), Some(cur)) if !cur.is_empty() => Some(cur.to_uppercase()),
        _ => None,
    }
}

fn rpc(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": util::now_ms(),
        "method": method,
        "params": params
    })
}

impl TradeNormalizer for DeribitStream {
    fn exchange(&self) -> &'static str {
        "deribit"
    }

    fn natural_key(&self, raw: &Value) -> Option<String> {
        util::value_string(raw.get("trade_id"))
    }

    fn normalize(&self, raw: &Value) -> Option<Trade> {
        normalize_trade(raw)
    }

    fn accepts(&self, raw: &Value) -> bool {
        is_option(raw)
    }

    fn block_trades_table(&self, partition: &str) -> Option<String> {
        Some(util::block_trades_table(self.exchange(), partition))
    }
}

impl StreamProtocol for DeribitStream {
    fn ws_url(&self, _partitions: &[String]) -> String {
        WS_URL.to_string()
    }

    fn heartbeat_setup(&self, interval_secs: u64) -> Option<Value> {
        // Deribit rejects intervals below 10 seconds
        Some(rpc("public/set_heartbeat", json!({ "interval": interval_secs.max(10) })))
    }

    fn subscribe_messages(&self, partitions: &[String]) -> Vec<Value> {
        partitions
            .iter()
            .map(|cur| rpc("public/subscribe", json!({ "channels": [channel_for(cur)] })))
            .collect()
    }

    fn unsubscribe_messages(&self, partitions: &[String]) -> Vec<Value> {
        let channels: Vec<String> = partitions.iter().map(|c| channel_for(c)).collect();
        vec![rpc("public/unsubscribe", json!({ "channels": channels }))]
    }

    fn classify(&self, raw: &str) -> Frame {
        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return Frame::Error(format!("malformed frame: {e}")),
        };

        if let Some(err) = v.get("error") {
            return Frame::Error(err.to_string());
        }

        match v.get("method").and_then(|m| m.as_str()) {
            Some("subscription") => {
                let params = &v["params"];
                let Some(partition) = params
                    .get("channel")
                    .and_then(|c| c.as_str())
                    .and_then(partition_from_channel)
                else {
                    return Frame::Error("subscription frame without channel".into());
                };
                let entries = params
                    .get("data")
                    .and_then(|d| d.as_array())
                    .cloned()
                    .unwrap_or_default();
                Frame::Data { partition, entries }
            }
            Some("heartbeat") => {
                if v["params"]["type"].as_str() == Some("test_request") {
                    Frame::TestRequest
                } else {
                    Frame::Keepalive
                }
            }
            _ => Frame::Control,
        }
    }

    fn heartbeat_reply(&self) -> Option<Value> {
        Some(rpc("public/test", json!({})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        json!({
            "trade_id": "ETH-123456",
            "instrument_name": "ETH-29MAR24-3000-C",
            "price": 0.0525,
            "amount": 5.0,
            "contracts": 5.0,
            "direction": "buy",
            "mark_price": 0.051,
            "index_price": 3012.5,
            "iv": 61.2,
            "trade_seq": 77,
            "tick_direction": 1,
            "block_trade_id": "BLOCK-9",
            "block_trade_leg_count": 2,
            "timestamp": 1_711_670_400_000i64
        })
    }

    #[test]
    fn normalizes_full_trade() {
        let t = DeribitPoll.normalize(&sample()).expect("trade");
        assert_eq!(t.trade_id, "ETH-123456");
        assert_eq!(t.instrument_name, "ETH-29MAR24-3000-C");
        assert_eq!(t.price, Some(0.0525));
        assert_eq!(t.direction, Some(Direction::Buy));
        assert_eq!(t.block_trade_leg_count, Some(2));
        assert!(t.is_block_trade());
        assert_eq!(t.timestamp.timestamp_millis(), 1_711_670_400_000);
    }

    #[test]
    fn unparsable_price_is_kept_as_none() {
        let mut raw = sample();
        raw["price"] = json!("n/a");
        let t = DeribitPoll.normalize(&raw).expect("trade kept");
        assert_eq!(t.price, None);
    }

    #[test]
    fn missing_trade_id_discards_record() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("trade_id");
        assert!(DeribitPoll.normalize(&raw).is_none());
    }

    #[test]
    fn filters_non_option_instruments() {
        assert!(DeribitPoll.accepts(&sample()));
        assert!(!DeribitPoll.accepts(&json!({ "instrument_name": "BTC-PERPETUAL" })));
    }

    #[test]
    fn rest_error_body_is_protocol_error() {
        let err = extract_rest_trades(&json!({ "error": { "code": 10028 } })).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Protocol);
        let ok = extract_rest_trades(&json!({ "result": { "trades": [sample()] } })).unwrap();
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn classifies_subscription_and_heartbeat_frames() {
        let data = json!({
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": { "channel": "trades.option.BTC.100ms", "data": [sample()] }
        })
        .to_string();
        match DeribitStream.classify(&data) {
            Frame::Data { partition, entries } => {
                assert_eq!(partition, "BTC");
                assert_eq!(entries.len(), 1);
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let frame = r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#;
        assert!(matches!(DeribitStream.classify(frame), Frame::TestRequest));

        let beat = r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"heartbeat"}}"#;
        assert!(matches!(DeribitStream.classify(beat), Frame::Keepalive));

        let err = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Invalid params"}}"#;
        assert!(matches!(DeribitStream.classify(err), Frame::Error(_)));

        assert!(matches!(DeribitStream.classify("{oops"), Frame::Error(_)));
        assert!(matches!(
            DeribitStream.classify(r#"{"jsonrpc":"2.0","id":1,"result":["trades.option.BTC.100ms"]}"#),
            Frame::Control
        ));
    }

    #[test]
    fn heartbeat_handshake_messages() {
        let setup = DeribitStream.heartbeat_setup(30).unwrap();
        assert_eq!(setup["method"], "public/set_heartbeat");
        assert_eq!(setup["params"]["interval"], 30);
        assert_eq!(DeribitStream.heartbeat_reply().unwrap()["method"], "public/test");

        let subs = DeribitStream.subscribe_messages(&["BTC".into(), "ETH".into()]);
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[1]["params"]["channels"][0], "trades.option.ETH.100ms");
    }
}
