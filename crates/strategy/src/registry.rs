use std::collections::BTreeMap;

use tracing::info;

use common::{Activation, Candle, Result, Signal, StrategyKind};

use crate::config::{Params, StrategyConfig, StrategyDefaults};
use crate::Strategy;

/// One activated strategy: its validated config plus the built instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveStrategy {
    pub config: StrategyConfig,
    pub strategy: Strategy,
}

impl ActiveStrategy {
    /// Evaluate the strategy over its own suffix of the shared series.
    pub fn generate(&self, symbol: &str, series: &[Candle]) -> Option<Signal> {
        let start = series.len().saturating_sub(self.config.window_capacity);
        self.strategy.generate(symbol, &series[start..])
    }
}

/// The set of active strategies, at most one per kind.
///
/// Each kind moves INACTIVE → ACTIVE on `activate` and back on `deactivate`;
/// nothing else is tracked.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    defaults: StrategyDefaults,
    active: BTreeMap<StrategyKind, ActiveStrategy>,
}

impl StrategyRegistry {
    pub fn new(defaults: StrategyDefaults) -> Self {
        Self {
            defaults,
            active: BTreeMap::new(),
        }
    }

    /// Validate and activate `kind`. Re-activating an active kind leaves it
    /// untouched and reports `AlreadyActive`. Nothing changes on error.
    pub fn activate(&mut self, kind: StrategyKind, params: Params) -> Result<Activation> {
        if self.active.contains_key(&kind) {
            return Ok(Activation::AlreadyActive);
        }

        let config = StrategyConfig::new(kind, params, self.defaults)?;
        let strategy = Strategy::build(kind, &config.params)?;
        if config.window_capacity < strategy.min_history() {
            return Err(common::Error::InvalidParameter {
                kind,
                reason: format!(
                    "window_capacity {} is below the {} candles this strategy needs",
                    config.window_capacity,
                    strategy.min_history()
                ),
            });
        }

        info!(
            strategy = %kind,
            window = config.window_capacity,
            min_history = strategy.min_history(),
            "Registered strategy"
        );
        self.active.insert(kind, ActiveStrategy { config, strategy });
        Ok(Activation::Activated)
    }

    /// Returns `true` if `kind` was active.
    pub fn deactivate(&mut self, kind: StrategyKind) -> bool {
        let removed = self.active.remove(&kind).is_some();
        if removed {
            info!(strategy = %kind, "Deregistered strategy");
        }
        removed
    }

    /// Deactivate everything, returning the kinds that were active.
    pub fn clear(&mut self) -> Vec<StrategyKind> {
        let kinds = self.kinds();
        self.active.clear();
        kinds
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        self.active.keys().copied().collect()
    }

    pub fn is_active(&self, kind: StrategyKind) -> bool {
        self.active.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Owned copy of the active set so evaluation can run without holding
    /// whatever guard protects the registry.
    pub fn snapshot(&self) -> Vec<ActiveStrategy> {
        self.active.values().cloned().collect()
    }
}
