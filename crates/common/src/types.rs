use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// One confirmed OHLCV candle for a symbol.
///
/// `open_time` is the interval start in epoch milliseconds and is strictly
/// increasing within a symbol's rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: f64,
}

impl Candle {
    pub fn open_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.open_time).single()
    }
}

/// Direction of a trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

/// The closed set of strategy families the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    #[serde(alias = "rsi")]
    Rsi,
    #[serde(alias = "macd")]
    Macd,
    #[serde(alias = "bollinger")]
    Bollinger,
    #[serde(alias = "ichimoku")]
    Ichimoku,
    #[serde(alias = "harmonic")]
    Harmonic,
    #[serde(alias = "volume_profile")]
    VolumeProfile,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::Rsi,
        StrategyKind::Macd,
        StrategyKind::Bollinger,
        StrategyKind::Ichimoku,
        StrategyKind::Harmonic,
        StrategyKind::VolumeProfile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Rsi => "RSI",
            StrategyKind::Macd => "MACD",
            StrategyKind::Bollinger => "BOLLINGER",
            StrategyKind::Ichimoku => "ICHIMOKU",
            StrategyKind::Harmonic => "HARMONIC",
            StrategyKind::VolumeProfile => "VOLUME_PROFILE",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    /// Case-insensitive; `-` and `_` are interchangeable (`volume-profile`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| Error::UnknownStrategy(s.to_string()))
    }
}

/// Indicator output carried on a signal: a number or a short descriptive token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Numeric(f64),
    Token(String),
}

impl std::fmt::Display for SignalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalValue::Numeric(v) => write!(f, "{v:.2}"),
            SignalValue::Token(t) => f.write_str(t),
        }
    }
}

/// Output of one strategy evaluation for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_kind: StrategyKind,
    pub symbol: String,
    pub direction: Direction,
    pub raw_value: SignalValue,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub reference_price: f64,
}

/// Cross-strategy decision for one symbol in one evaluation round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSignal {
    pub symbol: String,
    pub direction: Direction,
    pub combined_confidence: f64,
    pub reference_price: f64,
    pub timestamp: DateTime<Utc>,
    pub contributing_signals: Vec<Signal>,
}

/// Result of activating a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Activated,
    AlreadyActive,
}

impl std::fmt::Display for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Activation::Activated => write!(f, "activated"),
            Activation::AlreadyActive => write!(f, "already active"),
        }
    }
}

/// A validated kline interval token as used in stream topics and REST queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interval(String);

impl Interval {
    pub const VALID: [&'static str; 13] = [
        "1", "3", "5", "15", "30", "60", "120", "240", "360", "720", "D", "W", "M",
    ];

    pub fn parse(token: &str) -> Result<Self, Error> {
        let token = token.trim().to_ascii_uppercase();
        if Self::VALID.contains(&token.as_str()) {
            Ok(Self(token))
        } else {
            Err(Error::Config(format!(
                "invalid interval '{token}', expected one of {}",
                Self::VALID.join(", ")
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn minutes(&self) -> u32 {
        match self.0.as_str() {
            "D" => 1_440,
            "W" => 10_080,
            "M" => 43_200,
            // Only numeric tokens remain after validation.
            n => n.parse().unwrap_or(0),
        }
    }

    pub fn millis(&self) -> i64 {
        i64::from(self.minutes()) * 60_000
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self("60".to_string())
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::parse(s)
    }
}
