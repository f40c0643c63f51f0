use serde::Deserialize;
use serde_json::Value;

use common::{Candle, Error, Interval, Result};

/// One kline record from a stream data frame.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineUpdate {
    pub candle: Candle,
    pub interval: String,
    /// True once the interval has closed; only these reach the window store.
    pub confirmed: bool,
}

pub fn kline_topic(interval: &Interval, symbol: &str) -> String {
    format!("kline.{interval}.{symbol}")
}

/// `kline.60.BTCUSDT` → `BTCUSDT`.
pub fn symbol_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("kline"), Some(_), Some(symbol)) if !symbol.is_empty() => Some(symbol),
        _ => None,
    }
}

/// Parse the `data` array of a kline frame.
pub fn parse_kline_data(topic: &str, data: Value) -> Result<Vec<KlineUpdate>> {
    let symbol = symbol_from_topic(topic)
        .ok_or_else(|| Error::Exchange(format!("not a kline topic: {topic}")))?;
    let records: Vec<KlineRecord> = serde_json::from_value(data)?;

    records
        .into_iter()
        .map(|r| {
            Ok(KlineUpdate {
                candle: Candle {
                    symbol: symbol.to_string(),
                    open_time: r.start,
                    open: parse_price("open", &r.open)?,
                    high: parse_price("high", &r.high)?,
                    low: parse_price("low", &r.low)?,
                    close: parse_price("close", &r.close)?,
                    volume: parse_price("volume", &r.volume)?,
                    turnover: parse_price("turnover", &r.turnover)?,
                },
                interval: r.interval,
                confirmed: r.confirm,
            })
        })
        .collect()
}

pub(crate) fn parse_price(field: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::Exchange(format!("invalid {field} '{raw}'")))
}

// ─── Bybit kline JSON parsing ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct KlineRecord {
    start: i64,
    interval: String,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    turnover: String,
    confirm: bool,
}
