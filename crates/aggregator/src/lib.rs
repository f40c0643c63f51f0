pub mod aggregator;

pub use aggregator::{AggregatorConfig, RoundSignals, SignalAggregator};
