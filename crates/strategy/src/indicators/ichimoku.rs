use common::{Candle, Direction, Result, SignalValue};

use crate::config::ParamReader;
use crate::{Evaluation, SignalStrategy};

use super::midpoint;

/// Ichimoku cloud strategy.
///
/// The cloud under the latest bar is built from the leading spans computed
/// `displacement` bars earlier. BUY when the close is above the cloud with
/// the conversion line above the base line; SELL on the mirror image.
#[derive(Debug, Clone, PartialEq)]
pub struct IchimokuIndicator {
    pub conversion: usize,
    pub base: usize,
    pub span_b: usize,
    pub displacement: usize,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IchimokuReading {
    pub conversion: f64,
    pub base: f64,
    pub prev_conversion: f64,
    pub prev_base: f64,
    pub span_a: f64,
    pub span_b: f64,
}

impl IchimokuIndicator {
    pub(crate) fn from_params(p: &mut ParamReader<'_>) -> Result<Self> {
        let ichi = Self {
            conversion: p.param_usize("conversion", 20)?,
            base: p.param_usize("base", 60)?,
            span_b: p.param_usize("span_b", 120)?,
            displacement: p.param_usize("displacement", 30)?,
            min_confidence: p.param_unit("min_confidence", 0.5)?,
        };
        p.ensure(
            1 <= ichi.conversion && ichi.conversion <= ichi.base && ichi.base <= ichi.span_b,
            || {
                format!(
                    "periods must satisfy 1 <= conversion <= base <= span_b, got {}/{}/{}",
                    ichi.conversion, ichi.base, ichi.span_b
                )
            },
        )?;
        Ok(ichi)
    }

    /// Conversion and base lines for the bar at `idx`.
    fn lines_at(&self, window: &[Candle], idx: usize) -> Option<(f64, f64)> {
        let conversion = midpoint(&window[idx + 1 - self.conversion..=idx])?;
        let base = midpoint(&window[idx + 1 - self.base..=idx])?;
        Some((conversion, base))
    }
}

impl SignalStrategy for IchimokuIndicator {
    type Reading = IchimokuReading;

    fn min_history(&self) -> usize {
        self.span_b + self.displacement
    }

    fn compute_indicator(&self, window: &[Candle]) -> Option<IchimokuReading> {
        let n = window.len();
        if n < self.min_history() || n < self.base + 1 {
            return None;
        }

        let (conversion, base) = self.lines_at(window, n - 1)?;
        let (prev_conversion, prev_base) = self.lines_at(window, n - 2)?;

        let cloud_idx = n - 1 - self.displacement;
        let (cloud_conversion, cloud_base) = self.lines_at(window, cloud_idx)?;
        let span_a = (cloud_conversion + cloud_base) / 2.0;
        let span_b = midpoint(&window[cloud_idx + 1 - self.span_b..=cloud_idx])?;

        Some(IchimokuReading {
            conversion,
            base,
            prev_conversion,
            prev_base,
            span_a,
            span_b,
        })
    }

    fn evaluate(&self, r: IchimokuReading, window: &[Candle]) -> Option<Evaluation> {
        let close = window.last()?.close;
        if close <= 0.0 {
            return None;
        }
        let cloud_top = r.span_a.max(r.span_b);
        let cloud_bottom = r.span_a.min(r.span_b);

        let (direction, clearance, fresh_cross) =
            if close > cloud_top && r.conversion > r.base {
                (
                    Direction::Buy,
                    close - cloud_top,
                    r.prev_conversion <= r.prev_base,
                )
            } else if close < cloud_bottom && r.conversion < r.base {
                (
                    Direction::Sell,
                    cloud_bottom - close,
                    r.prev_conversion >= r.prev_base,
                )
            } else {
                return None;
            };

        // 2% clearance, 1% line spread and a 2% thick cloud each count as full.
        let distance = (clearance / close * 50.0).min(1.0);
        let cross = ((r.conversion - r.base).abs() / close * 100.0).min(1.0);
        let thickness = ((cloud_top - cloud_bottom) / close * 50.0).min(1.0);
        let fresh = if fresh_cross { 1.0 } else { 0.0 };

        let confidence =
            (0.5 + 0.2 * distance + 0.15 * cross + 0.1 * thickness + 0.05 * fresh).clamp(0.0, 1.0);
        if confidence < self.min_confidence {
            return None;
        }

        Some(Evaluation {
            direction,
            raw_value: SignalValue::Token(format!("TK: {:.4}/{:.4}", r.conversion, r.base)),
            confidence,
        })
    }
}
