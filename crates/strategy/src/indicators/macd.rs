use common::{Candle, Direction, Result, SignalValue};

use crate::config::ParamReader;
use crate::{Evaluation, SignalStrategy};

use super::{closes, ema_series};

/// Histogram size, as a fraction of price, that counts as full divergence.
const DIVERGENCE_SCALE: f64 = 0.001;
const ZERO_TOLERANCE: f64 = 1e-9;

/// MACD (Moving Average Convergence/Divergence) strategy.
///
/// MACD line = EMA(fast) − EMA(slow), signal = EMA(macd_line, signal_period),
/// histogram = MACD − signal. Fires on a histogram sign flip between the
/// previous and the latest bar.
#[derive(Debug, Clone, PartialEq)]
pub struct MacdIndicator {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
    pub trend_lookback: usize,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacdReading {
    pub macd: f64,
    pub signal: f64,
    /// Histogram tail, oldest first; at least two values.
    pub histogram: Vec<f64>,
}

impl MacdIndicator {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast,
            slow,
            signal,
            trend_lookback: 5,
            min_confidence: 0.5,
        }
    }

    pub(crate) fn from_params(p: &mut ParamReader<'_>) -> Result<Self> {
        let macd = Self {
            fast: p.param_usize("fast", 12)?,
            slow: p.param_usize("slow", 26)?,
            signal: p.param_usize("signal", 9)?,
            trend_lookback: p.param_usize("trend_lookback", 5)?,
            min_confidence: p.param_unit("min_confidence", 0.5)?,
        };
        p.ensure(macd.fast >= 1 && macd.signal >= 1, || {
            "fast and signal periods must be >= 1".to_string()
        })?;
        p.ensure(macd.fast < macd.slow, || {
            format!(
                "fast period must be less than slow period, got {}/{}",
                macd.fast, macd.slow
            )
        })?;
        p.ensure(macd.trend_lookback >= 1, || {
            "trend_lookback must be >= 1".to_string()
        })?;
        Ok(macd)
    }

    /// Compute MACD line, signal line and the histogram tail from close
    /// prices (oldest first). Needs at least `slow + signal` prices.
    pub fn compute(&self, closes: &[f64]) -> Option<MacdReading> {
        if closes.len() < self.slow + self.signal {
            return None;
        }

        let fast = ema_series(closes, self.fast);
        let slow = ema_series(closes, self.slow);
        // Align fast EMA with slow EMA: both end at the last close.
        let offset = fast.len() - slow.len();
        let macd_line: Vec<f64> = slow
            .iter()
            .zip(&fast[offset..])
            .map(|(s, f)| f - s)
            .collect();

        let signal_line = ema_series(&macd_line, self.signal);
        let macd_offset = macd_line.len() - signal_line.len();
        let histogram: Vec<f64> = signal_line
            .iter()
            .zip(&macd_line[macd_offset..])
            .map(|(s, m)| m - s)
            .collect();

        if histogram.len() < 2 {
            return None;
        }

        let keep = (self.trend_lookback + 1).max(2).min(histogram.len());
        Some(MacdReading {
            macd: *macd_line.last()?,
            signal: *signal_line.last()?,
            histogram: histogram[histogram.len() - keep..].to_vec(),
        })
    }
}

impl SignalStrategy for MacdIndicator {
    type Reading = MacdReading;

    fn min_history(&self) -> usize {
        self.slow + self.signal
    }

    fn compute_indicator(&self, window: &[Candle]) -> Option<MacdReading> {
        self.compute(&closes(window))
    }

    fn evaluate(&self, reading: MacdReading, window: &[Candle]) -> Option<Evaluation> {
        let price = window.last()?.close;
        if price <= 0.0 {
            return None;
        }

        let n = reading.histogram.len();
        let prev = reading.histogram[n - 2];
        let curr = reading.histogram[n - 1];
        // Values this close to zero are rounding noise on a flat histogram.
        let tol = price * ZERO_TOLERANCE;

        let (direction, token) = if prev <= tol && curr > tol {
            (Direction::Buy, "bullish crossover")
        } else if prev >= -tol && curr < -tol {
            (Direction::Sell, "bearish crossover")
        } else {
            return None;
        };

        let divergence = (curr.abs() / price / DIVERGENCE_SCALE).min(1.0);

        // Share of recent histogram steps moving in the signal direction.
        let steps: Vec<f64> = reading.histogram.windows(2).map(|w| w[1] - w[0]).collect();
        let agreeing = steps
            .iter()
            .filter(|&&d| match direction {
                Direction::Buy => d > 0.0,
                Direction::Sell => d < 0.0,
            })
            .count();
        let consistency = agreeing as f64 / steps.len() as f64;

        let confidence = (0.5 + 0.3 * divergence + 0.2 * consistency).clamp(0.0, 1.0);
        if confidence < self.min_confidence {
            return None;
        }

        Some(Evaluation {
            direction,
            raw_value: SignalValue::Token(token.to_string()),
            confidence,
        })
    }
}
