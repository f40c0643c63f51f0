use common::{Candle, Direction, Result, SignalValue};

use crate::config::ParamReader;
use crate::{Evaluation, SignalStrategy};

use super::{closes, mean, std_dev};

/// Bollinger band strategy: SMA(period) ± std_dev·σ.
///
/// BUY when the close is below the lower band, SELL above the upper band.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerIndicator {
    pub period: usize,
    pub std_dev: f64,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerReading {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub sigma: f64,
    /// Current band width (upper − lower).
    pub width: f64,
    /// Mean band width over the last `period` bars.
    pub avg_width: f64,
    /// Middle band change over the last half period.
    pub middle_slope: f64,
}

impl BollingerIndicator {
    pub(crate) fn from_params(p: &mut ParamReader<'_>) -> Result<Self> {
        let bb = Self {
            period: p.param_usize("period", 20)?,
            std_dev: p.param_f64("std_dev", 2.0)?,
            min_confidence: p.param_unit("min_confidence", 0.5)?,
        };
        p.ensure(bb.period >= 2, || format!("period must be >= 2, got {}", bb.period))?;
        p.ensure(bb.std_dev > 0.0, || {
            format!("std_dev must be positive, got {}", bb.std_dev)
        })?;
        Ok(bb)
    }

    /// Middle band and σ for the `period` closes ending at `end` (exclusive).
    fn band_at(&self, closes: &[f64], end: usize) -> (f64, f64) {
        let slice = &closes[end - self.period..end];
        (mean(slice), std_dev(slice))
    }
}

impl SignalStrategy for BollingerIndicator {
    type Reading = BollingerReading;

    fn min_history(&self) -> usize {
        2 * self.period
    }

    fn compute_indicator(&self, window: &[Candle]) -> Option<BollingerReading> {
        let closes = closes(window);
        let n = closes.len();
        if n < self.min_history() {
            return None;
        }

        let (middle, sigma) = self.band_at(&closes, n);
        let widths: Vec<f64> = (n - self.period + 1..=n)
            .map(|end| 2.0 * self.std_dev * self.band_at(&closes, end).1)
            .collect();
        let (middle_prev, _) = self.band_at(&closes, n - self.period / 2);

        let width = 2.0 * self.std_dev * sigma;
        Some(BollingerReading {
            upper: middle + width / 2.0,
            middle,
            lower: middle - width / 2.0,
            sigma,
            width,
            avg_width: mean(&widths),
            middle_slope: middle - middle_prev,
        })
    }

    fn evaluate(&self, r: BollingerReading, window: &[Candle]) -> Option<Evaluation> {
        if r.sigma <= 0.0 {
            return None;
        }
        let close = window.last()?.close;

        let (direction, penetration) = if close < r.lower {
            (Direction::Buy, r.lower - close)
        } else if close > r.upper {
            (Direction::Sell, close - r.upper)
        } else {
            return None;
        };

        // Penetration measured in σ so volatile markets need a deeper break.
        let depth = (penetration / r.sigma).min(1.0);
        let squeeze = if r.avg_width > 0.0 {
            ((r.avg_width - r.width) / r.avg_width).clamp(0.0, 1.0)
        } else {
            0.0
        };
        // A flat middle band favours reversion back to it.
        let trend = (1.0 - r.middle_slope.abs() / r.sigma).clamp(0.0, 1.0);

        let confidence = (0.4 + 0.3 * depth + 0.15 * squeeze + 0.15 * trend).clamp(0.0, 1.0);
        if confidence < self.min_confidence {
            return None;
        }

        let percent_b = (close - r.lower) / r.width;
        Some(Evaluation {
            direction,
            raw_value: SignalValue::Numeric(percent_b),
            confidence,
        })
    }
}
