use std::collections::{HashMap, VecDeque};

use tracing::debug;

use common::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// open_time not after the newest stored candle.
    Rejected,
}

/// Closed candles for one symbol, oldest first, bounded by `capacity`.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, candle: Candle) -> AppendOutcome {
        if let Some(last) = self.candles.back() {
            if candle.open_time <= last.open_time {
                return AppendOutcome::Rejected;
            }
        }
        if self.candles.len() == self.capacity {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
        AppendOutcome::Appended
    }

    pub fn last_open_time(&self) -> Option<i64> {
        self.candles.back().map(|c| c.open_time)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }
}

/// One canonical window per symbol. Strategies read suffixes of it.
#[derive(Debug)]
pub struct RollingWindowStore {
    windows: HashMap<String, RollingWindow>,
    capacity: usize,
}

impl RollingWindowStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Replace the window for `symbol` with `candles` (backfill). Ordering
    /// and capacity rules apply as for `append`. Returns the stored length.
    pub fn init(&mut self, symbol: &str, candles: Vec<Candle>) -> usize {
        let mut window = RollingWindow::new(self.capacity);
        let mut rejected = 0usize;
        for candle in candles {
            if window.append(candle) == AppendOutcome::Rejected {
                rejected += 1;
            }
        }
        if rejected > 0 {
            debug!(%symbol, rejected, "Backfill contained out-of-order candles");
        }
        let len = window.len();
        self.windows.insert(symbol.to_string(), window);
        len
    }

    pub fn append(&mut self, candle: Candle) -> AppendOutcome {
        let capacity = self.capacity;
        let window = self
            .windows
            .entry(candle.symbol.clone())
            .or_insert_with(|| RollingWindow::new(capacity));

        if let Some(last) = window.last_open_time().filter(|&last| candle.open_time <= last) {
            debug!(symbol = %candle.symbol, open_time = candle.open_time, last, "Stale or duplicate candle dropped");
            return AppendOutcome::Rejected;
        }
        window.append(candle)
    }

    /// Copy of the window for `symbol`, oldest first. Empty when unknown.
    pub fn snapshot(&self, symbol: &str) -> Vec<Candle> {
        self.windows.get(symbol).map(RollingWindow::to_vec).unwrap_or_default()
    }

    pub fn remove(&mut self, symbol: &str) -> bool {
        self.windows.remove(symbol).is_some()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.windows.contains_key(symbol)
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.windows.get(symbol).map_or(0, RollingWindow::len)
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }
}
