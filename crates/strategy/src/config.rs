use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use common::{Error, Result, StrategyKind};

/// Strategy parameters as they arrive from the config file or a control call.
pub type Params = HashMap<String, toml::Value>;

/// Top-level strategy config file (TOML).
///
/// Example `config/strategies.toml`:
/// ```toml
/// [[strategy]]
/// type = "rsi"
///
/// [strategy.params]
/// period = 14
/// overbought = 70.0
/// oversold = 30.0
///
/// [aggregator]
/// min_confidence = 0.5
/// ```
///
/// The `[aggregator]` table is read separately by the aggregator crate.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StrategyFileConfig {
    #[serde(rename = "strategy", default)]
    pub strategies: Vec<StrategyEntry>,
}

/// One `[[strategy]]` entry. The type stays a string until activation so an
/// unknown name is reported as an activation error instead of a parse error.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyEntry {
    /// Strategy type identifier, e.g. "rsi" or "volume_profile".
    #[serde(rename = "type")]
    pub strategy_type: String,
    /// Indicator-specific parameters, plus the optional `interval_minutes`
    /// and `window_capacity` overrides.
    #[serde(default)]
    pub params: Params,
}

impl StrategyFileConfig {
    /// Load from a TOML file. Exits process on error.
    pub fn load(path: &str) -> Self {
        let content = std::fs::read_to_string(path).unwrap_or_else(|e| {
            panic!("Failed to read strategy config at '{path}': {e}")
        });
        toml::from_str(&content).unwrap_or_else(|e| {
            panic!("Failed to parse strategy config at '{path}': {e}")
        })
    }
}

/// Engine-wide values a strategy config falls back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyDefaults {
    pub interval_minutes: u32,
    pub window_capacity: usize,
}

/// Validated configuration of one active strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    pub interval_minutes: u32,
    /// Length of the suffix of the shared series this strategy evaluates.
    pub window_capacity: usize,
    /// Indicator parameters with the shared keys stripped.
    pub params: Params,
}

impl StrategyConfig {
    /// Split the shared keys out of `params` and validate them against the
    /// engine defaults. Indicator keys are validated when the strategy is built.
    pub fn new(kind: StrategyKind, mut params: Params, defaults: StrategyDefaults) -> Result<Self> {
        let interval_minutes = match params.remove("interval_minutes") {
            Some(v) => as_integer(kind, "interval_minutes", &v)? as u32,
            None => defaults.interval_minutes,
        };
        if interval_minutes != defaults.interval_minutes {
            return Err(Error::InvalidParameter {
                kind,
                reason: format!(
                    "interval_minutes {interval_minutes} does not match the stream interval of {} minutes",
                    defaults.interval_minutes
                ),
            });
        }

        let window_capacity = match params.remove("window_capacity") {
            Some(v) => as_integer(kind, "window_capacity", &v)? as usize,
            None => defaults.window_capacity,
        };
        if window_capacity == 0 || window_capacity > defaults.window_capacity {
            return Err(Error::InvalidParameter {
                kind,
                reason: format!(
                    "window_capacity must be in 1..={}, got {window_capacity}",
                    defaults.window_capacity
                ),
            });
        }

        Ok(Self {
            kind,
            interval_minutes,
            window_capacity,
            params,
        })
    }
}

// ─── Parameter reading ────────────────────────────────────────────────────────

/// Typed access to indicator parameters. Every key read is recorded so that
/// `finish` can reject anything left over.
pub(crate) struct ParamReader<'a> {
    kind: StrategyKind,
    params: &'a Params,
    seen: BTreeSet<&'static str>,
}

impl<'a> ParamReader<'a> {
    pub(crate) fn new(kind: StrategyKind, params: &'a Params) -> Self {
        Self {
            kind,
            params,
            seen: BTreeSet::new(),
        }
    }

    pub(crate) fn param_f64(&mut self, key: &'static str, default: f64) -> Result<f64> {
        self.seen.insert(key);
        let value = match self.params.get(key) {
            None => return Ok(default),
            Some(toml::Value::Float(f)) => *f,
            Some(toml::Value::Integer(i)) => *i as f64,
            Some(other) => {
                return Err(self.invalid(format!(
                    "'{key}' must be a number, got {}",
                    other.type_str()
                )))
            }
        };
        if !value.is_finite() {
            return Err(self.invalid(format!("'{key}' must be finite")));
        }
        Ok(value)
    }

    pub(crate) fn param_usize(&mut self, key: &'static str, default: usize) -> Result<usize> {
        self.seen.insert(key);
        match self.params.get(key) {
            None => Ok(default),
            Some(v) => Ok(as_integer(self.kind, key, v)? as usize),
        }
    }

    /// Fraction in `[0, 1]`, e.g. a confidence floor.
    pub(crate) fn param_unit(&mut self, key: &'static str, default: f64) -> Result<f64> {
        let value = self.param_f64(key, default)?;
        self.ensure((0.0..=1.0).contains(&value), || {
            format!("'{key}' must be within [0, 1], got {value}")
        })?;
        Ok(value)
    }

    pub(crate) fn ensure(&self, ok: bool, reason: impl FnOnce() -> String) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(self.invalid(reason()))
        }
    }

    pub(crate) fn invalid(&self, reason: String) -> Error {
        Error::InvalidParameter {
            kind: self.kind,
            reason,
        }
    }

    /// Reject keys the strategy never asked for.
    pub(crate) fn finish(self) -> Result<()> {
        let mut unknown: Vec<&str> = self
            .params
            .keys()
            .map(String::as_str)
            .filter(|k| !self.seen.iter().any(|seen| seen == k))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        unknown.sort_unstable();
        Err(self.invalid(format!("unknown parameter(s): {}", unknown.join(", "))))
    }
}

fn as_integer(kind: StrategyKind, key: &str, value: &toml::Value) -> Result<i64> {
    match value {
        toml::Value::Integer(i) if *i >= 0 => Ok(*i),
        toml::Value::Integer(i) => Err(Error::InvalidParameter {
            kind,
            reason: format!("'{key}' must not be negative, got {i}"),
        }),
        other => Err(Error::InvalidParameter {
            kind,
            reason: format!("'{key}' must be an integer, got {}", other.type_str()),
        }),
    }
}
