use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer};
use tracing::debug;

use common::{AggregatedSignal, Direction, Signal, StrategyKind};

/// Signals of one evaluation round: symbol → strategy → latest signal.
pub type RoundSignals = BTreeMap<String, BTreeMap<StrategyKind, Signal>>;

/// Tunable aggregation parameters, read from the `[aggregator]` table of the
/// strategy config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Per-kind reliability weights. Kinds not listed use `default_weight`.
    #[serde(deserialize_with = "weights_by_kind")]
    pub weights: HashMap<StrategyKind, f64>,
    pub default_weight: f64,
    /// Groups whose combined confidence falls below this are discarded.
    pub min_confidence: f64,
    /// Maximum amplification when every active strategy agrees (0.1 = +10%).
    pub agreement_bonus: f64,
    /// Maximum number of aggregated signals handed out per round.
    pub max_batch: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        let weights = [
            (StrategyKind::Rsi, 0.8),
            (StrategyKind::Macd, 0.7),
            (StrategyKind::Bollinger, 0.75),
            (StrategyKind::Ichimoku, 0.85),
            (StrategyKind::Harmonic, 0.7),
            (StrategyKind::VolumeProfile, 0.65),
        ]
        .into_iter()
        .collect();
        Self {
            weights,
            default_weight: 0.5,
            min_confidence: 0.5,
            agreement_bonus: 0.1,
            max_batch: 10,
        }
    }
}

/// Table keys are strategy names in any spelling `StrategyKind` parses.
fn weights_by_kind<'de, D>(deserializer: D) -> Result<HashMap<StrategyKind, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, f64>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(name, weight)| {
            let kind = name.parse::<StrategyKind>().map_err(serde::de::Error::custom)?;
            Ok((kind, weight))
        })
        .collect()
}

#[derive(Deserialize)]
struct AggregatorSection {
    #[serde(default)]
    aggregator: AggregatorConfig,
}

impl AggregatorConfig {
    /// Read the `[aggregator]` table from the TOML file at `path`, falling back
    /// to defaults when the table is absent. Exits process on error.
    pub fn load(path: &str) -> Self {
        let content = std::fs::read_to_string(path).unwrap_or_else(|e| {
            panic!("Failed to read aggregator config at '{path}': {e}")
        });
        Self::from_toml(&content)
            .unwrap_or_else(|e| panic!("Failed to parse aggregator config at '{path}': {e}"))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<AggregatorSection>(content).map(|s| s.aggregator)
    }

    pub fn weight(&self, kind: StrategyKind) -> f64 {
        self.weights.get(&kind).copied().unwrap_or(self.default_weight)
    }
}

/// Combines per-strategy signals into one decision per symbol.
#[derive(Debug, Clone, Default)]
pub struct SignalAggregator {
    config: AggregatorConfig,
}

impl SignalAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Aggregate one round.
    ///
    /// Per symbol the signals are split by direction; each group scores a
    /// weighted mean confidence, amplified by the share of active strategies
    /// that agree. Groups under `min_confidence` are dropped and at most one
    /// direction survives per symbol. Output is sorted by confidence
    /// (descending, then symbol) and truncated to `max_batch`.
    pub fn aggregate(&self, round: &RoundSignals, active_strategies: usize) -> Vec<AggregatedSignal> {
        let mut out: Vec<AggregatedSignal> = round
            .iter()
            .filter_map(|(symbol, signals)| self.decide(symbol, signals, active_strategies))
            .collect();

        out.sort_by(|a, b| {
            b.combined_confidence
                .total_cmp(&a.combined_confidence)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        out.truncate(self.config.max_batch);
        out
    }

    fn decide(
        &self,
        symbol: &str,
        signals: &BTreeMap<StrategyKind, Signal>,
        active_strategies: usize,
    ) -> Option<AggregatedSignal> {
        let group = |direction: Direction| -> Vec<&Signal> {
            signals.values().filter(|s| s.direction == direction).collect()
        };
        let buy = self.combine(symbol, Direction::Buy, &group(Direction::Buy), active_strategies);
        let sell = self.combine(symbol, Direction::Sell, &group(Direction::Sell), active_strategies);

        match (buy, sell) {
            (Some(b), Some(s)) => {
                if b.combined_confidence > s.combined_confidence {
                    Some(b)
                } else if s.combined_confidence > b.combined_confidence {
                    Some(s)
                } else {
                    debug!(symbol = %symbol, confidence = b.combined_confidence, "Opposing groups tied, discarding both");
                    None
                }
            }
            (b, s) => b.or(s),
        }
    }

    fn combine(
        &self,
        symbol: &str,
        direction: Direction,
        members: &[&Signal],
        active_strategies: usize,
    ) -> Option<AggregatedSignal> {
        let latest = members
            .iter()
            .copied()
            .reduce(|best, s| if s.timestamp > best.timestamp { s } else { best })?;

        let (weighted, total_weight) = members.iter().fold((0.0, 0.0), |(sum, w), s| {
            let weight = self.config.weight(s.strategy_kind);
            (sum + weight * s.confidence, w + weight)
        });
        if total_weight <= 0.0 {
            return None;
        }

        let agreeing = members.len();
        let share = agreeing as f64 / active_strategies.max(agreeing) as f64;
        let combined = (weighted / total_weight * (1.0 + self.config.agreement_bonus * share))
            .clamp(0.0, 1.0);

        if combined < self.config.min_confidence {
            debug!(symbol = %symbol, direction = %direction, confidence = combined, "Group below threshold");
            return None;
        }

        Some(AggregatedSignal {
            symbol: symbol.to_string(),
            direction,
            combined_confidence: combined,
            reference_price: latest.reference_price,
            timestamp: latest.timestamp,
            contributing_signals: members.iter().map(|s| (*s).clone()).collect(),
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::SignalValue;

    fn make_signal(
        symbol: &str,
        kind: StrategyKind,
        direction: Direction,
        confidence: f64,
        ts_ms: i64,
        price: f64,
    ) -> Signal {
        Signal {
            strategy_kind: kind,
            symbol: symbol.into(),
            direction,
            raw_value: SignalValue::Numeric(0.0),
            confidence,
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            reference_price: price,
        }
    }

    fn round(signals: Vec<Signal>) -> RoundSignals {
        let mut round = RoundSignals::new();
        for s in signals {
            round
                .entry(s.symbol.clone())
                .or_default()
                .insert(s.strategy_kind, s);
        }
        round
    }

    fn equal_weights() -> AggregatorConfig {
        AggregatorConfig {
            weights: HashMap::new(),
            default_weight: 1.0,
            ..AggregatorConfig::default()
        }
    }

    #[test]
    fn higher_group_wins_on_disagreement() {
        let agg = SignalAggregator::new(equal_weights());
        let input = round(vec![
            make_signal("X", StrategyKind::Rsi, Direction::Buy, 0.6, 1_000, 10.0),
            make_signal("X", StrategyKind::Macd, Direction::Sell, 0.55, 1_000, 10.0),
        ]);
        let out = agg.aggregate(&input, 2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].direction, Direction::Buy);
        assert_eq!(out[0].contributing_signals.len(), 1);
    }

    #[test]
    fn exact_tie_discards_both_directions() {
        let agg = SignalAggregator::new(equal_weights());
        let input = round(vec![
            make_signal("X", StrategyKind::Rsi, Direction::Buy, 0.7, 1_000, 10.0),
            make_signal("X", StrategyKind::Macd, Direction::Sell, 0.7, 1_000, 10.0),
        ]);
        assert!(agg.aggregate(&input, 2).is_empty());
    }

    #[test]
    fn weighted_mean_uses_kind_weights() {
        let agg = SignalAggregator::new(AggregatorConfig {
            agreement_bonus: 0.0,
            ..AggregatorConfig::default()
        });
        let input = round(vec![
            make_signal("X", StrategyKind::Ichimoku, Direction::Buy, 1.0, 1_000, 10.0),
            make_signal("X", StrategyKind::Macd, Direction::Buy, 0.5, 1_000, 10.0),
        ]);
        let out = agg.aggregate(&input, 2);
        let expected = (0.85 * 1.0 + 0.7 * 0.5) / (0.85 + 0.7);
        assert!((out[0].combined_confidence - expected).abs() < 1e-12);
    }

    #[test]
    fn agreement_bonus_scales_with_active_share() {
        let agg = SignalAggregator::new(equal_weights());
        let input = round(vec![make_signal("X", StrategyKind::Rsi, Direction::Buy, 0.6, 1_000, 10.0)]);
        let alone = agg.aggregate(&input, 1)[0].combined_confidence;
        let among_four = agg.aggregate(&input, 4)[0].combined_confidence;
        assert!((alone - 0.66).abs() < 1e-12);
        assert!((among_four - 0.615).abs() < 1e-12);
    }

    #[test]
    fn below_threshold_is_dropped() {
        let agg = SignalAggregator::new(equal_weights());
        let input = round(vec![make_signal("X", StrategyKind::Rsi, Direction::Sell, 0.3, 1_000, 10.0)]);
        assert!(agg.aggregate(&input, 6).is_empty());
    }

    #[test]
    fn latest_member_supplies_price_and_time() {
        let agg = SignalAggregator::new(equal_weights());
        let input = round(vec![
            make_signal("X", StrategyKind::Rsi, Direction::Buy, 0.8, 1_000, 10.0),
            make_signal("X", StrategyKind::Bollinger, Direction::Buy, 0.8, 5_000, 12.5),
            make_signal("X", StrategyKind::Macd, Direction::Buy, 0.8, 3_000, 11.0),
        ]);
        let out = agg.aggregate(&input, 3);
        assert_eq!(out[0].reference_price, 12.5);
        assert_eq!(out[0].timestamp.timestamp_millis(), 5_000);
    }

    #[test]
    fn output_sorted_and_truncated() {
        let agg = SignalAggregator::new(AggregatorConfig {
            max_batch: 2,
            ..equal_weights()
        });
        let input = round(vec![
            make_signal("AAA", StrategyKind::Rsi, Direction::Buy, 0.6, 1_000, 1.0),
            make_signal("BBB", StrategyKind::Rsi, Direction::Buy, 0.9, 1_000, 1.0),
            make_signal("CCC", StrategyKind::Rsi, Direction::Sell, 0.9, 1_000, 1.0),
        ]);
        let out = agg.aggregate(&input, 1);
        let symbols: Vec<&str> = out.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BBB", "CCC"]);
    }

    #[test]
    fn config_reads_aggregator_table() {
        let cfg = AggregatorConfig::from_toml(
            r#"
            [[strategy]]
            type = "rsi"

            [aggregator]
            min_confidence = 0.65
            max_batch = 5

            [aggregator.weights]
            RSI = 0.9
            volume_profile = 0.4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.min_confidence, 0.65);
        assert_eq!(cfg.max_batch, 5);
        assert_eq!(cfg.weight(StrategyKind::Rsi), 0.9);
        assert_eq!(cfg.weight(StrategyKind::VolumeProfile), 0.4);
        assert_eq!(cfg.weight(StrategyKind::Macd), cfg.default_weight);
        assert_eq!(cfg.agreement_bonus, 0.1);
    }

    #[test]
    fn missing_table_uses_defaults() {
        let cfg = AggregatorConfig::from_toml("").unwrap();
        assert_eq!(cfg.weight(StrategyKind::Ichimoku), 0.85);
        assert_eq!(cfg.max_batch, 10);
    }
}
