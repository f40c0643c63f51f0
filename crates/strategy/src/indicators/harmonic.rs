use common::{Candle, Direction, Result, SignalValue};

use crate::config::ParamReader;
use crate::{Evaluation, SignalStrategy};

/// Target ratios AB/XA, BC/AB and CD/BC per pattern.
const PATTERNS: [(&str, [f64; 3]); 4] = [
    ("Gartley", [0.618, 0.386, 1.272]),
    ("Butterfly", [0.786, 0.382, 1.618]),
    ("Bat", [0.382, 0.886, 2.618]),
    ("Crab", [0.382, 0.886, 3.618]),
];

/// Harmonic pattern strategy.
///
/// Extracts swing pivots, takes the last five as X-A-B-C-D and matches the
/// leg ratios against the Fibonacci templates above. A D that is a swing
/// low completes a bullish pattern (BUY); a swing high completes a bearish
/// one (SELL).
#[derive(Debug, Clone, PartialEq)]
pub struct HarmonicIndicator {
    /// Bars on each side a pivot must dominate.
    pub swing_window: usize,
    /// Maximum relative error per ratio.
    pub tolerance: f64,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PivotKind {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pivot {
    index: usize,
    price: f64,
    kind: PivotKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarmonicReading {
    pub pattern: &'static str,
    /// Mean closeness of the three ratios, `1.0` being an exact match.
    pub closeness: f64,
    pub bullish: bool,
}

impl HarmonicIndicator {
    pub(crate) fn from_params(p: &mut ParamReader<'_>) -> Result<Self> {
        let h = Self {
            swing_window: p.param_usize("swing_window", 5)?,
            tolerance: p.param_f64("tolerance", 0.15)?,
            min_confidence: p.param_unit("min_confidence", 0.7)?,
        };
        p.ensure(h.swing_window >= 1, || "swing_window must be >= 1".to_string())?;
        p.ensure(h.tolerance > 0.0 && h.tolerance < 1.0, || {
            format!("tolerance must be within (0, 1), got {}", h.tolerance)
        })?;
        Ok(h)
    }

    /// Strict local extrema over ±`swing_window` bars, compressed so that
    /// highs and lows alternate (the more extreme of a run is kept).
    fn pivots(&self, window: &[Candle]) -> Vec<Pivot> {
        let w = self.swing_window;
        let n = window.len();
        let mut pivots: Vec<Pivot> = Vec::new();
        if n < 2 * w + 1 {
            return pivots;
        }

        for i in w..n - w {
            let neighbours = (i - w..=i + w).filter(|&j| j != i);
            let high = window[i].high;
            let low = window[i].low;
            if neighbours.clone().all(|j| window[j].high < high) {
                push_alternating(&mut pivots, Pivot { index: i, price: high, kind: PivotKind::High });
            }
            if neighbours.clone().all(|j| window[j].low > low) {
                push_alternating(&mut pivots, Pivot { index: i, price: low, kind: PivotKind::Low });
            }
        }
        pivots
    }
}

fn push_alternating(pivots: &mut Vec<Pivot>, pivot: Pivot) {
    match pivots.last_mut() {
        Some(last) if last.kind == pivot.kind => {
            let more_extreme = match pivot.kind {
                PivotKind::High => pivot.price > last.price,
                PivotKind::Low => pivot.price < last.price,
            };
            if more_extreme {
                *last = pivot;
            }
        }
        _ => pivots.push(pivot),
    }
}

impl SignalStrategy for HarmonicIndicator {
    type Reading = HarmonicReading;

    fn min_history(&self) -> usize {
        (6 * self.swing_window).max(30)
    }

    fn compute_indicator(&self, window: &[Candle]) -> Option<HarmonicReading> {
        let pivots = self.pivots(window);
        if pivots.len() < 5 {
            return None;
        }
        let [x, a, b, c, d] = [
            pivots[pivots.len() - 5],
            pivots[pivots.len() - 4],
            pivots[pivots.len() - 3],
            pivots[pivots.len() - 2],
            pivots[pivots.len() - 1],
        ];

        // D must be the most recent swing, not a stale pattern.
        if window.len() - 1 - d.index > 3 * self.swing_window {
            return None;
        }

        let xa = (a.price - x.price).abs();
        let ab = (b.price - a.price).abs();
        let bc = (c.price - b.price).abs();
        let cd = (d.price - c.price).abs();
        if xa == 0.0 || ab == 0.0 || bc == 0.0 {
            return None;
        }
        let ratios = [ab / xa, bc / ab, cd / bc];

        PATTERNS
            .iter()
            .filter_map(|(name, targets)| {
                let mut total = 0.0;
                for (ratio, target) in ratios.iter().zip(targets) {
                    let error = (ratio / target - 1.0).abs();
                    if error > self.tolerance {
                        return None;
                    }
                    total += 1.0 - error / self.tolerance;
                }
                Some((*name, total / 3.0))
            })
            .max_by(|l, r| l.1.total_cmp(&r.1))
            .map(|(pattern, closeness)| HarmonicReading {
                pattern,
                closeness,
                bullish: d.kind == PivotKind::Low,
            })
    }

    fn evaluate(&self, reading: HarmonicReading, _window: &[Candle]) -> Option<Evaluation> {
        let confidence = reading.closeness.clamp(0.0, 1.0);
        if confidence < self.min_confidence {
            return None;
        }
        let (direction, side) = if reading.bullish {
            (Direction::Buy, "bullish")
        } else {
            (Direction::Sell, "bearish")
        };
        Some(Evaluation {
            direction,
            raw_value: SignalValue::Token(format!("{side} {}", reading.pattern)),
            confidence,
        })
    }
}
