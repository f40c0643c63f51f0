mod sink;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aggregator::{AggregatorConfig, SignalAggregator};
use common::{Config, StrategyKind};
use engine::{
    BybitClient, EngineSettings, RateLimiter, SignalEngine, StreamConfig, StreamTransport,
    TungsteniteConnector,
};
use strategy::StrategyFileConfig;

use crate::sink::LogSink;

#[tokio::main]
async fn main() {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!(interval = %cfg.interval, window = cfg.window_capacity, "Signalbot starting");

    let strategy_file = StrategyFileConfig::load(&cfg.strategy_config_path);
    let aggregator_cfg = AggregatorConfig::load(&cfg.strategy_config_path);

    // ── Exchange ──────────────────────────────────────────────────────────────
    let limiter = RateLimiter::new(
        cfg.rest_rate_limit,
        Duration::from_secs(cfg.rest_rate_window_secs),
    );
    let client = BybitClient::new(&cfg.rest_url, limiter)
        .unwrap_or_else(|e| panic!("Failed to build REST client: {e}"));
    let transport = StreamTransport::new(
        StreamConfig::from_config(&cfg),
        Arc::new(TungsteniteConnector),
    );

    // ── Engine ────────────────────────────────────────────────────────────────
    let engine = SignalEngine::new(
        EngineSettings::from_config(&cfg),
        Arc::new(client),
        transport,
        Arc::new(LogSink),
        SignalAggregator::new(aggregator_cfg),
    );

    for entry in strategy_file.strategies {
        let kind = match entry.strategy_type.parse::<StrategyKind>() {
            Ok(kind) => kind,
            Err(e) => {
                error!(error = %e, "Skipping strategy entry");
                continue;
            }
        };
        match engine.activate_strategy(kind, entry.params).await {
            Ok(activation) => info!(strategy = %kind, %activation, "Strategy configured"),
            Err(e) => error!(strategy = %kind, error = %e, "Strategy activation failed"),
        }
    }

    let active = engine.list_active_strategies().await;
    if active.is_empty() {
        error!("No strategy could be activated, nothing to do");
        return;
    }
    info!(strategies = ?active, "Signalbot running. Waiting for shutdown signal.");

    tokio::signal::ctrl_c().await.unwrap();
    info!("Shutdown signal received.");
    engine.shutdown().await;
}
