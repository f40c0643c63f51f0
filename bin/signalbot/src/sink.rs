use async_trait::async_trait;
use tracing::info;

use common::{AggregatedSignal, SignalSink};

/// Writes every aggregated signal to the log.
pub struct LogSink;

#[async_trait]
impl SignalSink for LogSink {
    async fn on_aggregated_signals(&self, signals: Vec<AggregatedSignal>) {
        for signal in &signals {
            let strategies: Vec<&str> = signal
                .contributing_signals
                .iter()
                .map(|s| s.strategy_kind.as_str())
                .collect();
            info!(
                symbol = %signal.symbol,
                direction = %signal.direction,
                confidence = format!("{:.3}", signal.combined_confidence),
                price = signal.reference_price,
                at = %signal.timestamp,
                ?strategies,
                "Signal"
            );
        }
    }
}
