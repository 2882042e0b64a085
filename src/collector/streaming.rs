use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, Utf8Bytes},
};

use crate::{
    config::ExchangeConfig,
    error::{CollectorError, CollectorResult, ErrorClass},
    exchanges::adapter::{Frame, StreamProtocol},
    metrics::METRICS,
};

use super::{
    CollectionStrategy, CollectorContext,
    backoff::Backoff,
    pipeline::{TradePipeline, report_persistence_error},
    queue::TradeQueue,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound for best-effort unsubscribe / close frames on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

const QUEUE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where decoded trade entries go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    /// Persist on the socket task, frame by frame
    Inline,
    /// Hand off to a [`TradeQueue`]
    Queued,
}

/// How a successfully established session ended.
enum SessionEnd {
    Cancelled,
    Disconnected(String),
}

/// Persistent WebSocket session with reconnects.
///
/// One `collect_once` keeps the stream alive until shutdown:
/// - connects, declares the heartbeat, subscribes every partition
/// - answers server test requests immediately
/// - sends the protocol's client ping when it has one
/// - reconnects with exponential backoff (1s doubling, 60s cap)
///
/// GUARANTEES:
/// - Backoff resets once a session is connected and subscribed
/// - A session that was up and then dropped does not count against
///   the reconnect budget
/// - `max_reconnect_attempts` consecutive failures to establish a
///   session end the cycle with the last error, so the core escalates
pub struct StreamingStrategy<P: StreamProtocol + 'static> {
    protocol: Arc<P>,
    partitions: Vec<String>,
    ctx: CollectorContext,
    pipeline: Arc<TradePipeline>,
    mode: SinkMode,
    queue: Option<TradeQueue>,
    queue_capacity: usize,
    seed_keys: i64,
    heartbeat_interval_secs: u64,
    max_reconnect_attempts: u32,
    backoff: Backoff,
}

impl<P: StreamProtocol + 'static> StreamingStrategy<P> {
    pub fn new(protocol: P, cfg: &ExchangeConfig, ctx: CollectorContext, mode: SinkMode) -> Self {
        let protocol = Arc::new(protocol);
        let pipeline = Arc::new(TradePipeline::new(protocol.clone(), cfg.dedup_capacity, ctx.clone()));
        Self {
            protocol,
            partitions: cfg.partitions(),
            ctx,
            pipeline,
            mode,
            queue: None,
            queue_capacity: cfg.queue_capacity,
            seed_keys: cfg.seed_keys,
            heartbeat_interval_secs: cfg.heartbeat_interval_secs,
            max_reconnect_attempts: cfg.max_reconnect_attempts.max(1),
            backoff: Backoff::default(),
        }
    }

    async fn send_json(write: &mut WsWrite, msg: &Value) -> CollectorResult<()> {
        write.send(Message::Text(Utf8Bytes::from(msg.to_string()))).await?;
        Ok(())
    }

    /// Connects and subscribes. Errors here count as a failed
    /// reconnect attempt.
    async fn open_session(&self) -> CollectorResult<(WsWrite, WsRead)> {
        let url = self.protocol.ws_url(&self.partitions);
        let (ws, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| CollectorError::TransientNetwork(format!("connect to {url} timed out")))??;

        let (mut write, read) = ws.split();

        if let Some(setup) = self.protocol.heartbeat_setup(self.heartbeat_interval_secs) {
            Self::send_json(&mut write, &setup).await?;
        }
        for sub in self.protocol.subscribe_messages(&self.partitions) {
            Self::send_json(&mut write, &sub).await?;
        }

        Ok((write, read))
    }

    /// Runs one established session until it drops or shutdown.
    async fn run_session(&mut self) -> CollectorResult<SessionEnd> {
        let (mut write, mut read) = self.open_session().await?;

        self.backoff.reset();
        self.ctx.stats.set_connected(true);
        METRICS.ws_connections_active.fetch_add(1, Ordering::Relaxed);
        info!("[{}] stream connected, {} partitions subscribed", self.ctx.name, self.partitions.len());

        let shutdown = self.ctx.shutdown.clone();
        let ping = self.protocol.client_ping();
        let mut ping_tick = interval(ping.map_or(Duration::from_secs(3600), |(every, _)| every));
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping_tick.tick().await;

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.close_session(&mut write).await;
                    break SessionEnd::Cancelled;
                }

                _ = ping_tick.tick(), if ping.is_some() => {
                    let Some((_, payload)) = ping else { continue };
                    if let Err(e) = write.send(Message::Text(Utf8Bytes::from(payload.to_string()))).await {
                        break SessionEnd::Disconnected(format!("ping failed: {e}"));
                    }
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        METRICS.frames_received.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = self.handle_text(&text, &mut write).await {
                            match e.class() {
                                ErrorClass::Persistence => report_persistence_error(&self.ctx, &e),
                                ErrorClass::TransientNetwork => break SessionEnd::Disconnected(e.to_string()),
                                _ => warn!("[{}] frame handling failed: {e}", self.ctx.name),
                            }
                        }
                    }

                    // Protocol-level ping: reply with the same payload
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            break SessionEnd::Disconnected("pong failed".into());
                        }
                    }

                    Some(Ok(Message::Close(frame))) => {
                        break SessionEnd::Disconnected(format!("closed by server: {frame:?}"));
                    }

                    // Ignore binary / pong / raw frames
                    Some(Ok(_)) => {}

                    Some(Err(e)) => break SessionEnd::Disconnected(e.to_string()),

                    None => break SessionEnd::Disconnected("stream ended".into()),
                }
            }
        };

        METRICS.ws_connections_active.fetch_sub(1, Ordering::Relaxed);
        self.ctx.stats.set_connected(false);
        Ok(end)
    }

    /// Best-effort unsubscribe and close frame.
    async fn close_session(&self, write: &mut WsWrite) {
        for msg in self.protocol.unsubscribe_messages(&self.partitions) {
            let _ = timeout(CLOSE_TIMEOUT, Self::send_json(write, &msg)).await;
        }
        let _ = timeout(CLOSE_TIMEOUT, write.send(Message::Close(None))).await;
        debug!("[{}] stream closed", self.ctx.name);
    }

    async fn handle_text(&self, text: &str, write: &mut WsWrite) -> CollectorResult<()> {
        match self.protocol.classify(text) {
            Frame::Data { partition, entries } => self.dispatch(&partition, entries).await,

            Frame::TestRequest => {
                if let Some(reply) = self.protocol.heartbeat_reply() {
                    Self::send_json(write, &reply).await?;
                    METRICS.heartbeat_replies.fetch_add(1, Ordering::Relaxed);
                    trace!("[{}] answered heartbeat test request", self.ctx.name);
                }
                Ok(())
            }

            Frame::Keepalive => {
                trace!("[{}] keepalive", self.ctx.name);
                Ok(())
            }

            Frame::Error(msg) => {
                warn!("[{}] exchange error frame: {msg}", self.ctx.name);
                Ok(())
            }

            Frame::Control => Ok(()),
        }
    }

    async fn dispatch(&self, partition: &str, entries: Vec<Value>) -> CollectorResult<()> {
        match (&self.mode, &self.queue) {
            (SinkMode::Queued, Some(queue)) => {
                for entry in entries {
                    queue.enqueue(partition, entry).await;
                }
                Ok(())
            }
            _ => self.pipeline.process_batch(partition, &entries).await.map(|_| ()),
        }
    }
}

#[async_trait]
impl<P: StreamProtocol + 'static> CollectionStrategy for StreamingStrategy<P> {
    async fn initialize(&mut self) -> CollectorResult<()> {
        if self.partitions.is_empty() {
            return Err(CollectorError::Configuration(format!("{}: no partitions to subscribe", self.ctx.name)));
        }
        self.pipeline.seed(&self.partitions, self.seed_keys).await;

        if self.mode == SinkMode::Queued {
            self.queue = Some(TradeQueue::start(self.pipeline.clone(), self.queue_capacity, self.ctx.clone()));
        }
        Ok(())
    }

    async fn collect_once(&mut self) -> CollectorResult<()> {
        let mut failures = 0u32;

        loop {
            if self.ctx.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.run_session().await {
                Ok(SessionEnd::Cancelled) => return Ok(()),
                Ok(SessionEnd::Disconnected(reason)) => {
                    failures = 0;
                    warn!("[{}] stream disconnected: {reason}", self.ctx.name);
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "[{}] connect attempt {failures}/{} failed: {e}",
                        self.ctx.name, self.max_reconnect_attempts
                    );
                    if failures >= self.max_reconnect_attempts {
                        return Err(e);
                    }
                }
            }

            METRICS.ws_reconnects.fetch_add(1, Ordering::Relaxed);
            let delay = self.backoff.next_delay();
            debug!("[{}] reconnecting in {delay:?}", self.ctx.name);

            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return Ok(()),
                _ = sleep(delay) => {}
            }
        }
    }

    async fn teardown(&mut self) -> CollectorResult<()> {
        if let Some(mut queue) = self.queue.take() {
            queue.close(QUEUE_DRAIN_TIMEOUT).await;
        }
        self.ctx.stats.set_connected(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::memory_context;
    use crate::exchanges::binance::BinanceOptionsAdapter;
    use crate::exchanges::adapter::TradeNormalizer;
    use crate::exchanges::deribit::DeribitStream;
    use crate::schema::Trade;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn config(name: &str, attempts: u32) -> ExchangeConfig {
        serde_json::from_value(json!({
            "name": name,
            "enabled": true,
            "currencies": ["btc"],
            "max_reconnect_attempts": attempts
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn data_frames_persist_inline() {
        let (ctx, gw) = memory_context("deribit_ws");
        let strategy = StreamingStrategy::new(DeribitStream, &config("deribit_ws", 5), ctx, SinkMode::Inline);

        let frame = json!({
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": {
                "channel": "trades.option.BTC.100ms",
                "data": [{
                    "trade_id": "BTC-1",
                    "instrument_name": "BTC-29MAR24-60000-C",
                    "price": 0.05,
                    "timestamp": 1_711_670_400_000i64
                }]
            }
        });
        let Frame::Data { partition, entries } = strategy.protocol.classify(&frame.to_string()) else {
            panic!("expected data frame");
        };
        strategy.dispatch(&partition, entries).await.unwrap();
        assert_eq!(gw.trades("deribit_btc_trades").len(), 1);
    }

    #[tokio::test]
    async fn queued_mode_drains_on_teardown() {
        let (ctx, gw) = memory_context("binance");
        let mut strategy = StreamingStrategy::new(BinanceOptionsAdapter, &config("binance", 5), ctx, SinkMode::Queued);
        strategy.initialize().await.unwrap();

        let entries = vec![json!({
            "e": "trade", "s": "BTC-240329-60000-C", "t": "1", "p": "10", "q": "1", "S": -1
        })];
        strategy.dispatch("BTC", entries).await.unwrap();
        strategy.teardown().await.unwrap();

        assert_eq!(gw.trades("binance_btc_trades").len(), 1);
    }

    /// Minimal heartbeat protocol against a local endpoint.
    struct LocalProtocol {
        url: String,
    }

    impl TradeNormalizer for LocalProtocol {
        fn exchange(&self) -> &'static str {
            "local"
        }

        fn natural_key(&self, raw: &Value) -> Option<String> {
            raw.get("id").map(|v| v.to_string())
        }

        fn normalize(&self, _raw: &Value) -> Option<Trade> {
            None
        }
    }

    impl StreamProtocol for LocalProtocol {
        fn ws_url(&self, _partitions: &[String]) -> String {
            self.url.clone()
        }

        fn heartbeat_setup(&self, interval_secs: u64) -> Option<Value> {
            Some(json!({ "method": "set_heartbeat", "interval": interval_secs }))
        }

        fn subscribe_messages(&self, partitions: &[String]) -> Vec<Value> {
            partitions
                .iter()
                .map(|p| json!({ "method": "subscribe", "channel": p }))
                .collect()
        }

        fn classify(&self, raw: &str) -> Frame {
            let v: Value = serde_json::from_str(raw).unwrap_or_default();
            if v["params"]["type"] == "test_request" {
                Frame::TestRequest
            } else {
                Frame::Control
            }
        }

        fn heartbeat_reply(&self) -> Option<Value> {
            Some(json!({ "method": "public/test" }))
        }
    }

    #[tokio::test]
    async fn exhausted_reconnect_budget_fails_the_cycle() {
        let (ctx, _) = memory_context("local");
        let protocol = LocalProtocol {
            url: "ws://127.0.0.1:1".into(),
        };
        let mut strategy = StreamingStrategy::new(protocol, &config("local", 3), ctx.clone(), SinkMode::Inline);

        // three refused connects, 1s + 2s of backoff in between
        let err = timeout(Duration::from_secs(20), strategy.collect_once())
            .await
            .expect("budget ends the cycle")
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientNetwork);
        assert_eq!(strategy.backoff.next_delay(), Duration::from_secs(4));
        assert!(!ctx.stats.is_connected());
    }

    #[tokio::test]
    async fn test_request_is_answered_on_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let mut methods = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                let v: Value = serde_json::from_str(&text).unwrap();
                let method = v["method"].as_str().unwrap_or_default().to_string();
                methods.push(method.clone());
                match method.as_str() {
                    "subscribe" => {
                        let request = json!({ "method": "heartbeat", "params": { "type": "test_request" } });
                        ws.send(Message::Text(Utf8Bytes::from(request.to_string()))).await.unwrap();
                    }
                    "public/test" => break,
                    _ => {}
                }
            }
            methods
        });

        let (ctx, _) = memory_context("local");
        let protocol = LocalProtocol {
            url: format!("ws://{addr}"),
        };
        let mut strategy = StreamingStrategy::new(protocol, &config("local", 3), ctx.clone(), SinkMode::Inline);
        let runner = tokio::spawn(async move { strategy.collect_once().await });

        let methods = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert_eq!(methods, vec!["set_heartbeat", "subscribe", "public/test"]);

        ctx.shutdown.cancel();
        let result = timeout(Duration::from_secs(10), runner).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancelled_before_connect_returns_ok() {
        let (ctx, _) = memory_context("deribit_ws");
        ctx.shutdown.cancel();
        let mut strategy = StreamingStrategy::new(DeribitStream, &config("deribit_ws", 5), ctx, SinkMode::Inline);
        assert!(strategy.collect_once().await.is_ok());
    }
}
