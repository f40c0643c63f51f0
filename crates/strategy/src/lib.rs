pub mod config;
pub mod indicators;
pub mod registry;

pub use config::{Params, StrategyConfig, StrategyDefaults, StrategyEntry, StrategyFileConfig};
pub use registry::{ActiveStrategy, StrategyRegistry};

use common::{Candle, Direction, Result, Signal, SignalValue, StrategyKind};

use crate::config::ParamReader;
use crate::indicators::{
    BollingerIndicator, HarmonicIndicator, IchimokuIndicator, MacdIndicator, RsiIndicator,
    VolumeProfileIndicator,
};

/// The hooks every strategy family provides.
///
/// Implementations are pure over the window they are given: no state is
/// carried between evaluations.
pub trait SignalStrategy {
    /// Indicator reading produced from a window, consumed by `evaluate`.
    type Reading;

    /// Windows shorter than this never produce a signal.
    fn min_history(&self) -> usize;

    /// Compute the indicator over `window` (oldest first).
    /// Returns `None` when the indicator is undefined for this window.
    fn compute_indicator(&self, window: &[Candle]) -> Option<Self::Reading>;

    /// Turn a reading into a directional call, or `None` when nothing fires.
    fn evaluate(&self, reading: Self::Reading, window: &[Candle]) -> Option<Evaluation>;
}

/// A directional call before it is stamped with symbol, time and price.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub direction: Direction,
    pub raw_value: SignalValue,
    pub confidence: f64,
}

/// Shared `generate` flow for every strategy family.
pub fn generate_with<S: SignalStrategy>(
    strategy: &S,
    kind: StrategyKind,
    symbol: &str,
    window: &[Candle],
) -> Option<Signal> {
    if window.len() < strategy.min_history() {
        return None;
    }
    let reading = strategy.compute_indicator(window)?;
    let evaluation = strategy.evaluate(reading, window)?;
    if !evaluation.confidence.is_finite() {
        return None;
    }
    let last = window.last()?;
    Some(Signal {
        strategy_kind: kind,
        symbol: symbol.to_string(),
        direction: evaluation.direction,
        raw_value: evaluation.raw_value,
        confidence: evaluation.confidence.clamp(0.0, 1.0),
        timestamp: last.open_datetime()?,
        reference_price: last.close,
    })
}

/// Enum-dispatched strategy instance: one variant per `StrategyKind`.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    Rsi(RsiIndicator),
    Macd(MacdIndicator),
    Bollinger(BollingerIndicator),
    Ichimoku(IchimokuIndicator),
    Harmonic(HarmonicIndicator),
    VolumeProfile(VolumeProfileIndicator),
}

impl Strategy {
    /// Build a strategy of `kind` from its indicator parameters.
    /// Unknown keys, wrong types and out-of-range values are rejected.
    pub fn build(kind: StrategyKind, params: &Params) -> Result<Self> {
        let mut reader = ParamReader::new(kind, params);
        let strategy = match kind {
            StrategyKind::Rsi => Strategy::Rsi(RsiIndicator::from_params(&mut reader)?),
            StrategyKind::Macd => Strategy::Macd(MacdIndicator::from_params(&mut reader)?),
            StrategyKind::Bollinger => {
                Strategy::Bollinger(BollingerIndicator::from_params(&mut reader)?)
            }
            StrategyKind::Ichimoku => {
                Strategy::Ichimoku(IchimokuIndicator::from_params(&mut reader)?)
            }
            StrategyKind::Harmonic => {
                Strategy::Harmonic(HarmonicIndicator::from_params(&mut reader)?)
            }
            StrategyKind::VolumeProfile => {
                Strategy::VolumeProfile(VolumeProfileIndicator::from_params(&mut reader)?)
            }
        };
        reader.finish()?;
        Ok(strategy)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Rsi(_) => StrategyKind::Rsi,
            Strategy::Macd(_) => StrategyKind::Macd,
            Strategy::Bollinger(_) => StrategyKind::Bollinger,
            Strategy::Ichimoku(_) => StrategyKind::Ichimoku,
            Strategy::Harmonic(_) => StrategyKind::Harmonic,
            Strategy::VolumeProfile(_) => StrategyKind::VolumeProfile,
        }
    }

    pub fn min_history(&self) -> usize {
        match self {
            Strategy::Rsi(s) => s.min_history(),
            Strategy::Macd(s) => s.min_history(),
            Strategy::Bollinger(s) => s.min_history(),
            Strategy::Ichimoku(s) => s.min_history(),
            Strategy::Harmonic(s) => s.min_history(),
            Strategy::VolumeProfile(s) => s.min_history(),
        }
    }

    /// Evaluate `window` for `symbol`. Returns `None` on insufficient history
    /// or when no signal fires.
    pub fn generate(&self, symbol: &str, window: &[Candle]) -> Option<Signal> {
        let kind = self.kind();
        match self {
            Strategy::Rsi(s) => generate_with(s, kind, symbol, window),
            Strategy::Macd(s) => generate_with(s, kind, symbol, window),
            Strategy::Bollinger(s) => generate_with(s, kind, symbol, window),
            Strategy::Ichimoku(s) => generate_with(s, kind, symbol, window),
            Strategy::Harmonic(s) => generate_with(s, kind, symbol, window),
            Strategy::VolumeProfile(s) => generate_with(s, kind, symbol, window),
        }
    }
}
