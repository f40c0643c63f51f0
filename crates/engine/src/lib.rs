pub mod bybit;
pub mod lifecycle;
pub mod round;
pub mod symbols;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use bybit::{BybitClient, RateLimiter, StreamConfig, StreamTransport, TungsteniteConnector};
pub use lifecycle::{EngineSettings, SignalEngine};
pub use symbols::{SymbolDiff, SymbolRegistry};
pub use window::{AppendOutcome, RollingWindow, RollingWindowStore};
