//! Exchange adapter registry and collector factory
//!
//! This module provides:
//! - Central registration of all supported collectors
//! - A factory that pairs each exchange adapter with its collection
//!   strategy (polling, streaming or backfill)
//!
//! All exchange-specific logic must live in dedicated adapter modules.
//! The collector runtime interacts exclusively through the traits in
//! `adapter`.

pub mod adapter;
pub mod binance;
pub mod bybit;
pub mod deribit;
pub mod okx;

use crate::{
    alerts::AlertSink,
    collector::{
        CollectionStrategy, Collector, CollectorContext, CoreSettings,
        backfill::BackfillStrategy,
        polling::PollingStrategy,
        streaming::{SinkMode, StreamingStrategy},
    },
    config::{AlertConfig, ExchangeConfig},
    error::{CollectorError, CollectorResult},
    persistence::SharedGateway,
};

/// Collector names accepted in `config.json`.
///
/// CONTRACT:
/// - Names are lowercase and stable
/// - `deribit` and `deribit_ws` share the same Deribit tables
pub const SUPPORTED_EXCHANGES: &[&str] = &["deribit", "deribit_ws", "okx", "binance", "bybit", "ohlc"];

/// Builds the collector for one configured exchange.
///
/// | name       | strategy                     | adapter                 |
/// |------------|------------------------------|-------------------------|
/// | deribit    | REST polling                 | DeribitPoll             |
/// | bybit      | REST polling                 | BybitPoll               |
/// | deribit_ws | WebSocket, inline persist    | DeribitStream           |
/// | okx        | WebSocket, inline persist    | OkxAdapter              |
/// | binance    | WebSocket, queued persist    | BinanceOptionsAdapter   |
/// | ohlc       | candle backfill              | BinanceKlines           |
///
/// RETURNS:
/// - `Err(Configuration)` if the name is unknown
pub fn build_collector(
    cfg: &ExchangeConfig,
    alert_cfg: &AlertConfig,
    gateway: SharedGateway,
    alerts: AlertSink,
) -> CollectorResult<Collector> {
    let ctx = CollectorContext::new(cfg.name.clone(), gateway, alerts);

    let strategy: Box<dyn CollectionStrategy> = match cfg.name.as_str() {
        "deribit" => Box::new(PollingStrategy::new(deribit::DeribitPoll, cfg, ctx.clone())),
        "bybit" => Box::new(PollingStrategy::new(bybit::BybitPoll, cfg, ctx.clone())),
        "deribit_ws" => Box::new(StreamingStrategy::new(deribit::DeribitStream, cfg, ctx.clone(), SinkMode::Inline)),
        "okx" => Box::new(StreamingStrategy::new(okx::OkxAdapter, cfg, ctx.clone(), SinkMode::Inline)),
        "binance" => Box::new(StreamingStrategy::new(
            binance::BinanceOptionsAdapter,
            cfg,
            ctx.clone(),
            SinkMode::Queued,
        )),
        "ohlc" => Box::new(BackfillStrategy::new(binance::BinanceKlines, cfg, ctx.clone())),
        other => {
            return Err(CollectorError::Configuration(format!("unknown exchange '{other}'")));
        }
    };

    Ok(Collector::new(ctx, CoreSettings::from_config(cfg, alert_cfg), strategy))
}
