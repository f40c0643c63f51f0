use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::{AggregatedSignal, Candle, Interval, Result};

/// Read-only market data from the exchange's REST side.
///
/// `BybitClient` implements this against the public v5 API. Tests use
/// in-memory implementations.
#[async_trait]
pub trait MarketDataClient: Send + Sync {
    /// Most recent closed candles for `symbol`, oldest first.
    /// Never includes the candle that is still in progress.
    async fn get_candles(&self, symbol: &str, interval: &Interval, limit: usize)
        -> Result<Vec<Candle>>;

    /// Symbols currently tradable upstream.
    async fn get_active_symbols(&self) -> Result<BTreeSet<String>>;
}

/// Receives the output of every completed evaluation round.
///
/// Called once per round, and only when there is at least one signal.
/// Formatting and delivery belong to the implementor.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn on_aggregated_signals(&self, signals: Vec<AggregatedSignal>);
}
