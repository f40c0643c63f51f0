use common::{Candle, Direction, Result, SignalValue};

use crate::config::ParamReader;
use crate::{Evaluation, SignalStrategy};

/// Volume profile strategy.
///
/// Builds a price-bucketed volume histogram from every candle but the latest,
/// derives the point of control and the value area, and fires when the latest
/// close sits outside the value area: BUY below it, SELL above it.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeProfileIndicator {
    pub price_levels: usize,
    /// Share of total volume the value area must cover.
    pub value_area: f64,
    /// Bars averaged for the relative-volume confirmation.
    pub volume_lookback: usize,
    pub min_history: usize,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeProfileReading {
    pub poc: f64,
    pub value_area_low: f64,
    pub value_area_high: f64,
    /// Latest volume over the mean of the preceding `volume_lookback` bars.
    pub relative_volume: f64,
}

impl VolumeProfileIndicator {
    pub(crate) fn from_params(p: &mut ParamReader<'_>) -> Result<Self> {
        let vp = Self {
            price_levels: p.param_usize("price_levels", 50)?,
            value_area: p.param_f64("value_area", 0.7)?,
            volume_lookback: p.param_usize("volume_lookback", 20)?,
            min_history: p.param_usize("min_history", 50)?,
            min_confidence: p.param_unit("min_confidence", 0.5)?,
        };
        p.ensure(vp.price_levels >= 2, || "price_levels must be >= 2".to_string())?;
        p.ensure(vp.value_area > 0.0 && vp.value_area < 1.0, || {
            format!("value_area must be within (0, 1), got {}", vp.value_area)
        })?;
        p.ensure(vp.volume_lookback >= 1, || "volume_lookback must be >= 1".to_string())?;
        p.ensure(vp.min_history > vp.volume_lookback, || {
            "min_history must exceed volume_lookback".to_string()
        })?;
        Ok(vp)
    }

    /// Volume per bucket; each candle's volume is spread over the buckets its
    /// high-low range overlaps, proportionally to the overlap.
    fn histogram(&self, candles: &[Candle], floor: f64, bucket: f64) -> Vec<f64> {
        let levels = self.price_levels;
        let index_of = |price: f64| (((price - floor) / bucket) as usize).min(levels - 1);
        let mut volumes = vec![0.0; levels];

        for c in candles {
            let range = c.high - c.low;
            if range <= 0.0 {
                volumes[index_of(c.close)] += c.volume;
                continue;
            }
            for (i, slot) in volumes
                .iter_mut()
                .enumerate()
                .take(index_of(c.high) + 1)
                .skip(index_of(c.low))
            {
                let lo = floor + i as f64 * bucket;
                let hi = lo + bucket;
                let overlap = c.high.min(hi) - c.low.max(lo);
                if overlap > 0.0 {
                    *slot += c.volume * overlap / range;
                }
            }
        }
        volumes
    }
}

impl SignalStrategy for VolumeProfileIndicator {
    type Reading = VolumeProfileReading;

    fn min_history(&self) -> usize {
        self.min_history
    }

    fn compute_indicator(&self, window: &[Candle]) -> Option<VolumeProfileReading> {
        let (latest, profile) = window.split_last()?;
        let floor = profile.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        let ceiling = profile.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
        if !(floor.is_finite() && ceiling.is_finite()) || ceiling <= floor {
            return None;
        }
        let bucket = (ceiling - floor) / self.price_levels as f64;
        let volumes = self.histogram(profile, floor, bucket);

        let total: f64 = volumes.iter().sum();
        if total <= 0.0 {
            return None;
        }
        let poc_idx = volumes
            .iter()
            .enumerate()
            .max_by(|l, r| l.1.total_cmp(r.1))
            .map(|(i, _)| i)?;

        // Grow the value area outward from the POC, taking the heavier side.
        let (mut lo, mut hi) = (poc_idx, poc_idx);
        let mut covered = volumes[poc_idx];
        while covered < self.value_area * total && (lo > 0 || hi + 1 < volumes.len()) {
            let below = if lo > 0 { volumes[lo - 1] } else { f64::NEG_INFINITY };
            let above = if hi + 1 < volumes.len() { volumes[hi + 1] } else { f64::NEG_INFINITY };
            if above >= below {
                hi += 1;
                covered += above;
            } else {
                lo -= 1;
                covered += below;
            }
        }

        let recent = &profile[profile.len().saturating_sub(self.volume_lookback)..];
        let mean_volume = recent.iter().map(|c| c.volume).sum::<f64>() / recent.len() as f64;
        let relative_volume = if mean_volume > 0.0 {
            latest.volume / mean_volume
        } else {
            1.0
        };

        Some(VolumeProfileReading {
            poc: floor + (poc_idx as f64 + 0.5) * bucket,
            value_area_low: floor + lo as f64 * bucket,
            value_area_high: floor + (hi + 1) as f64 * bucket,
            relative_volume,
        })
    }

    fn evaluate(&self, r: VolumeProfileReading, window: &[Candle]) -> Option<Evaluation> {
        let close = window.last()?.close;
        let width = r.value_area_high - r.value_area_low;
        if width <= 0.0 {
            return None;
        }

        let (direction, outside) = if close < r.value_area_low {
            (Direction::Buy, r.value_area_low - close)
        } else if close > r.value_area_high {
            (Direction::Sell, close - r.value_area_high)
        } else {
            return None;
        };

        let distance = (outside / width).min(1.0);
        let confirmation = (r.relative_volume - 1.0).clamp(0.0, 1.0);
        let confidence = (0.5 + 0.3 * distance + 0.2 * confirmation).clamp(0.0, 1.0);
        if confidence < self.min_confidence {
            return None;
        }

        Some(Evaluation {
            direction,
            raw_value: SignalValue::Numeric(r.poc),
            confidence,
        })
    }
}
