use std::collections::BTreeSet;

/// Result of comparing the tracked set with an upstream instrument list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolDiff {
    pub listed: BTreeSet<String>,
    pub delisted: BTreeSet<String>,
}

impl SymbolDiff {
    pub fn is_empty(&self) -> bool {
        self.listed.is_empty() && self.delisted.is_empty()
    }
}

/// Symbols currently tracked by the engine.
#[derive(Debug, Clone, Default)]
pub struct SymbolRegistry {
    symbols: BTreeSet<String>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_symbols(&self) -> &BTreeSet<String> {
        &self.symbols
    }

    pub fn diff(&self, upstream: &BTreeSet<String>) -> SymbolDiff {
        SymbolDiff {
            listed: upstream.difference(&self.symbols).cloned().collect(),
            delisted: self.symbols.difference(upstream).cloned().collect(),
        }
    }

    pub fn insert(&mut self, symbol: impl Into<String>) -> bool {
        self.symbols.insert(symbol.into())
    }

    pub fn remove(&mut self, symbol: &str) -> bool {
        self.symbols.remove(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn clear(&mut self) {
        self.symbols.clear();
    }
}
