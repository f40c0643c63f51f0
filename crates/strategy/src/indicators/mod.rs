pub mod bollinger;
pub mod harmonic;
pub mod ichimoku;
pub mod macd;
pub mod rsi;
pub mod volume_profile;

pub use bollinger::BollingerIndicator;
pub use harmonic::HarmonicIndicator;
pub use ichimoku::IchimokuIndicator;
pub use macd::MacdIndicator;
pub use rsi::RsiIndicator;
pub use volume_profile::VolumeProfileIndicator;

use common::Candle;

pub(crate) fn closes(window: &[Candle]) -> Vec<f64> {
    window.iter().map(|c| c.close).collect()
}

/// Simple moving average of the whole slice.
pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation of the whole slice.
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// EMA series seeded with the SMA of the first `period` values.
/// Element `i` of the output corresponds to `data[i + period - 1]`.
pub(crate) fn ema_series(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(data.len() - period + 1);
    let mut ema = mean(&data[..period]);
    out.push(ema);
    for &value in &data[period..] {
        ema = value * k + ema * (1.0 - k);
        out.push(ema);
    }
    out
}

/// Midpoint of the highest high and lowest low over `candles`.
pub(crate) fn midpoint(candles: &[Candle]) -> Option<f64> {
    let high = candles.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    if high.is_finite() && low.is_finite() {
        Some((high + low) / 2.0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_series_seeds_with_sma() {
        let series = ema_series(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(series.len(), 2);
        assert!((series[0] - 2.0).abs() < 1e-12);
        assert!((series[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn ema_series_empty_when_too_short() {
        assert!(ema_series(&[1.0, 2.0], 3).is_empty());
    }

    #[test]
    fn std_dev_of_constant_is_zero() {
        assert_eq!(std_dev(&[5.0; 10]), 0.0);
        assert!((std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]) - 2.0).abs() < 1e-12);
    }
}
