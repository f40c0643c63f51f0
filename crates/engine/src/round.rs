use std::collections::BTreeSet;

use tracing::{debug, warn};

use aggregator::RoundSignals;
use common::{Signal, StrategyKind};

/// What a report did to the round it belongs to.
#[derive(Debug, PartialEq)]
pub enum RoundProgress {
    /// Recorded; other tracked symbols have not reported yet.
    Pending,
    /// Every tracked symbol has reported. Carries the round's signals.
    Complete(RoundSignals),
    /// Belongs to a round that was already completed or abandoned.
    Stale,
}

#[derive(Debug)]
struct EvaluationRound {
    open_time: i64,
    reported: BTreeSet<String>,
    signals: RoundSignals,
}

impl EvaluationRound {
    fn new(open_time: i64) -> Self {
        Self {
            open_time,
            reported: BTreeSet::new(),
            signals: RoundSignals::new(),
        }
    }

    fn is_complete(&self, tracked: &BTreeSet<String>) -> bool {
        !self.reported.is_empty() && tracked.iter().all(|s| self.reported.contains(s))
    }
}

/// Collects per-symbol results for one candle open_time until every tracked
/// symbol has reported.
#[derive(Debug, Default)]
pub struct RoundTracker {
    current: Option<EvaluationRound>,
    last_completed: Option<i64>,
}

impl RoundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(
        &mut self,
        symbol: &str,
        open_time: i64,
        signals: Vec<Signal>,
        tracked: &BTreeSet<String>,
    ) -> RoundProgress {
        if self.last_completed.map_or(false, |done| open_time <= done) {
            return RoundProgress::Stale;
        }

        match &self.current {
            Some(round) if round.open_time > open_time => return RoundProgress::Stale,
            Some(round) if round.open_time < open_time => {
                warn!(
                    open_time = round.open_time,
                    reported = round.reported.len(),
                    tracked = tracked.len(),
                    "Abandoning incomplete round"
                );
                self.current = Some(EvaluationRound::new(open_time));
            }
            Some(_) => {}
            None => self.current = Some(EvaluationRound::new(open_time)),
        }

        let Some(round) = self.current.as_mut() else {
            return RoundProgress::Pending;
        };
        round.reported.insert(symbol.to_string());
        if !signals.is_empty() {
            let entry = round.signals.entry(symbol.to_string()).or_default();
            for signal in signals {
                entry.insert(signal.strategy_kind, signal);
            }
        }

        self.try_complete(tracked)
    }

    /// Remove `symbols` from the pending round. Returns its signals when
    /// the removal leaves nothing else to wait for.
    pub fn forget_symbols(&mut self, symbols: &BTreeSet<String>, tracked: &BTreeSet<String>) -> Option<RoundSignals> {
        let round = self.current.as_mut()?;
        for symbol in symbols {
            round.reported.remove(symbol);
            round.signals.remove(symbol);
        }
        match self.try_complete(tracked) {
            RoundProgress::Complete(signals) => Some(signals),
            _ => None,
        }
    }

    /// Discard pending signals from deactivated strategies.
    pub fn drop_strategies(&mut self, kinds: &[StrategyKind]) {
        let Some(round) = self.current.as_mut() else {
            return;
        };
        round.signals.retain(|_, by_kind| {
            by_kind.retain(|kind, _| !kinds.contains(kind));
            !by_kind.is_empty()
        });
    }

    /// Open time and reported count of the pending round.
    pub fn pending(&self) -> Option<(i64, usize)> {
        self.current.as_ref().map(|r| (r.open_time, r.reported.len()))
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.last_completed = None;
    }

    fn try_complete(&mut self, tracked: &BTreeSet<String>) -> RoundProgress {
        match self.current.take() {
            Some(round) if round.is_complete(tracked) => {
                debug!(open_time = round.open_time, symbols = round.reported.len(), "Round complete");
                self.last_completed = Some(round.open_time);
                RoundProgress::Complete(round.signals)
            }
            other => {
                self.current = other;
                RoundProgress::Pending
            }
        }
    }
}
