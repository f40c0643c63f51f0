use common::{Candle, Direction, Result, SignalValue};

use crate::config::ParamReader;
use crate::{Evaluation, SignalStrategy};

use super::closes;

/// RSI points of movement over the lookback that count as full momentum.
const MOMENTUM_SCALE: f64 = 10.0;

/// RSI (Relative Strength Index) strategy.
///
/// Uses Wilder's smoothed moving average (same as TradingView / standard RSI).
/// BUY below `oversold`, SELL above `overbought`. Confidence grows with the
/// distance past the bound, with the move over the last `momentum_lookback`
/// bars, and gets a flat bonus beyond the extreme band.
#[derive(Debug, Clone, PartialEq)]
pub struct RsiIndicator {
    pub period: usize,
    pub overbought: f64,
    pub oversold: f64,
    pub extreme_high: f64,
    pub extreme_low: f64,
    pub momentum_lookback: usize,
    pub min_confidence: f64,
}

/// RSI now and `momentum_lookback` bars ago (when the window is long enough).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RsiReading {
    pub value: f64,
    pub previous: Option<f64>,
}

impl RsiIndicator {
    pub fn new(period: usize, overbought: f64, oversold: f64) -> Self {
        Self {
            period,
            overbought,
            oversold,
            extreme_high: 80.0,
            extreme_low: 20.0,
            momentum_lookback: 3,
            min_confidence: 0.5,
        }
    }

    pub(crate) fn from_params(p: &mut ParamReader<'_>) -> Result<Self> {
        let rsi = Self {
            period: p.param_usize("period", 14)?,
            overbought: p.param_f64("overbought", 70.0)?,
            oversold: p.param_f64("oversold", 30.0)?,
            extreme_high: p.param_f64("extreme_high", 80.0)?,
            extreme_low: p.param_f64("extreme_low", 20.0)?,
            momentum_lookback: p.param_usize("momentum_lookback", 3)?,
            min_confidence: p.param_unit("min_confidence", 0.5)?,
        };
        p.ensure(rsi.period >= 2, || format!("period must be >= 2, got {}", rsi.period))?;
        p.ensure(
            0.0 < rsi.extreme_low
                && rsi.extreme_low <= rsi.oversold
                && rsi.oversold < rsi.overbought
                && rsi.overbought <= rsi.extreme_high
                && rsi.extreme_high < 100.0,
            || {
                format!(
                    "bounds must satisfy 0 < extreme_low <= oversold < overbought <= extreme_high < 100, got {}/{}/{}/{}",
                    rsi.extreme_low, rsi.oversold, rsi.overbought, rsi.extreme_high
                )
            },
        )?;
        p.ensure(rsi.momentum_lookback >= 1, || {
            "momentum_lookback must be >= 1".to_string()
        })?;
        Ok(rsi)
    }

    /// Compute RSI from a slice of close prices (oldest first).
    /// Returns `None` if there are fewer than `period + 1` values or the
    /// closes never moved.
    pub fn compute(&self, closes: &[f64]) -> Option<f64> {
        if self.period == 0 || closes.len() < self.period + 1 {
            return None;
        }

        // First average gain/loss over the initial `period` changes
        let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
        let initial = &changes[..self.period];

        let mut avg_gain = initial.iter().filter(|&&c| c > 0.0).sum::<f64>() / self.period as f64;
        let mut avg_loss = initial.iter().filter(|&&c| c < 0.0).map(|c| c.abs()).sum::<f64>()
            / self.period as f64;

        // Wilder smoothing over remaining changes
        for &change in &changes[self.period..] {
            let gain = if change > 0.0 { change } else { 0.0 };
            let loss = if change < 0.0 { change.abs() } else { 0.0 };
            avg_gain = (avg_gain * (self.period - 1) as f64 + gain) / self.period as f64;
            avg_loss = (avg_loss * (self.period - 1) as f64 + loss) / self.period as f64;
        }

        if avg_gain == 0.0 && avg_loss == 0.0 {
            return None;
        }
        if avg_loss == 0.0 {
            return Some(100.0);
        }

        let rs = avg_gain / avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}

impl SignalStrategy for RsiIndicator {
    type Reading = RsiReading;

    fn min_history(&self) -> usize {
        self.period + 1
    }

    fn compute_indicator(&self, window: &[Candle]) -> Option<RsiReading> {
        let closes = closes(window);
        let value = self.compute(&closes)?;
        let previous = closes
            .len()
            .checked_sub(self.momentum_lookback)
            .and_then(|end| self.compute(&closes[..end]));
        Some(RsiReading { value, previous })
    }

    fn evaluate(&self, reading: RsiReading, _window: &[Candle]) -> Option<Evaluation> {
        let RsiReading { value, previous } = reading;

        let (direction, distance, momentum, extreme) = if value < self.oversold {
            (
                Direction::Buy,
                (self.oversold - value) / self.oversold,
                previous.map_or(0.0, |p| p - value),
                value <= self.extreme_low,
            )
        } else if value > self.overbought {
            (
                Direction::Sell,
                (value - self.overbought) / (100.0 - self.overbought),
                previous.map_or(0.0, |p| value - p),
                value >= self.extreme_high,
            )
        } else {
            return None;
        };

        let momentum = (momentum / MOMENTUM_SCALE).clamp(0.0, 1.0);
        let bonus = if extreme { 0.1 } else { 0.0 };
        let confidence =
            (0.5 + 0.3 * distance.clamp(0.0, 1.0) + 0.1 * momentum + bonus).clamp(0.0, 1.0);

        if confidence < self.min_confidence {
            return None;
        }

        Some(Evaluation {
            direction,
            raw_value: SignalValue::Numeric(value),
            confidence,
        })
    }
}
