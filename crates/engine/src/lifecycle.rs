use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, trace, warn};

use aggregator::{RoundSignals, SignalAggregator};
use common::{
    Activation, Candle, Config, Interval, MarketDataClient, Result, Signal, SignalSink, StrategyKind,
};
use strategy::{Params, StrategyDefaults, StrategyRegistry};

use crate::bybit::protocol::CONTROL_BATCH;
use crate::bybit::{kline_topic, parse_kline_data, StreamTransport, TopicHandler};
use crate::round::{RoundProgress, RoundTracker};
use crate::symbols::{SymbolDiff, SymbolRegistry};
use crate::window::{AppendOutcome, RollingWindowStore};

/// Concurrent REST backfills when tracking new symbols.
const BACKFILL_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub interval: Interval,
    pub window_capacity: usize,
    pub reconcile_interval: Duration,
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            interval: cfg.interval.clone(),
            window_capacity: cfg.window_capacity,
            reconcile_interval: Duration::from_secs(cfg.reconcile_interval_secs),
        }
    }
}

/// Cloneable handle to the signal engine.
///
/// The kline stream runs only while at least one strategy is active:
/// the first activation connects, backfills every tracked symbol and
/// subscribes, the last deactivation tears all of it down. Each confirmed
/// candle is appended to its symbol's window, evaluated by every active
/// strategy and recorded in the round for its open_time. Completed rounds
/// are aggregated and handed to the sink.
#[derive(Clone)]
pub struct SignalEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    settings: EngineSettings,
    client: Arc<dyn MarketDataClient>,
    transport: StreamTransport,
    sink: Arc<dyn SignalSink>,
    aggregator: SignalAggregator,
    // Lock order: strategies, then market.
    strategies: RwLock<StrategyRegistry>,
    market: Mutex<MarketState>,
    /// Serializes activation, deactivation and reconciliation.
    control: Mutex<()>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

struct MarketState {
    registry: SymbolRegistry,
    windows: RollingWindowStore,
    rounds: RoundTracker,
}

impl SignalEngine {
    pub fn new(
        settings: EngineSettings,
        client: Arc<dyn MarketDataClient>,
        transport: StreamTransport,
        sink: Arc<dyn SignalSink>,
        aggregator: SignalAggregator,
    ) -> Self {
        let defaults = StrategyDefaults {
            interval_minutes: settings.interval.minutes(),
            window_capacity: settings.window_capacity,
        };
        let windows = RollingWindowStore::new(settings.window_capacity);

        Self {
            inner: Arc::new(EngineInner {
                settings,
                client,
                transport,
                sink,
                aggregator,
                strategies: RwLock::new(StrategyRegistry::new(defaults)),
                market: Mutex::new(MarketState {
                    registry: SymbolRegistry::new(),
                    windows,
                    rounds: RoundTracker::new(),
                }),
                control: Mutex::new(()),
                reconciler: Mutex::new(None),
            }),
        }
    }

    /// Activate `kind` with `params`. Invalid parameters are rejected before
    /// anything changes. The first activation also starts the stream and is
    /// rolled back if that fails.
    pub async fn activate_strategy(&self, kind: StrategyKind, params: Params) -> Result<Activation> {
        let _control = self.inner.control.lock().await;

        let first = {
            let mut strategies = self.inner.strategies.write().await;
            if strategies.activate(kind, params)? == Activation::AlreadyActive {
                info!(strategy = %kind, "Strategy already active");
                return Ok(Activation::AlreadyActive);
            }
            strategies.len() == 1
        };

        if first {
            if let Err(e) = self.inner.start_stream().await {
                warn!(strategy = %kind, error = %e, "Stream start failed, activation rolled back");
                self.inner.strategies.write().await.deactivate(kind);
                self.inner.stop_stream().await;
                return Err(e);
            }
        }

        info!(strategy = %kind, "Strategy activated");
        Ok(Activation::Activated)
    }

    /// Deactivate `kind`, or every strategy when `None`. Returns the kinds
    /// that were active. Deactivating the last strategy stops the stream.
    pub async fn deactivate_strategy(&self, kind: Option<StrategyKind>) -> Vec<StrategyKind> {
        let _control = self.inner.control.lock().await;

        let (removed, none_left) = {
            let mut strategies = self.inner.strategies.write().await;
            let removed = match kind {
                Some(kind) if strategies.deactivate(kind) => vec![kind],
                Some(_) => Vec::new(),
                None => strategies.clear(),
            };
            (removed, strategies.is_empty())
        };

        if removed.is_empty() {
            debug!(strategy = ?kind, "Nothing to deactivate");
            return removed;
        }

        self.inner.market.lock().await.rounds.drop_strategies(&removed);
        if none_left {
            self.inner.stop_stream().await;
        }
        info!(strategies = ?removed, "Strategies deactivated");
        removed
    }

    pub async fn list_active_strategies(&self) -> Vec<StrategyKind> {
        self.inner.strategies.read().await.kinds()
    }

    pub async fn current_symbols(&self) -> BTreeSet<String> {
        self.inner.market.lock().await.registry.current_symbols().clone()
    }

    /// Bring the tracked symbol set in line with the upstream instrument
    /// list. Returns what changed. No-op while the stream is stopped.
    pub async fn reconcile(&self) -> Result<SymbolDiff> {
        self.inner.reconcile().await
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Deactivate everything and stop the stream.
    pub async fn shutdown(&self) {
        let _control = self.inner.control.lock().await;
        let removed = self.inner.strategies.write().await.clear();
        self.inner.stop_stream().await;
        info!(strategies = ?removed, "Engine shut down");
    }
}

impl EngineInner {
    async fn start_stream(self: &Arc<Self>) -> Result<()> {
        info!(interval = %self.settings.interval, "Starting kline stream");
        self.transport.connect().await?;

        let upstream = self.client.get_active_symbols().await?;
        let tracked = self.track_symbols(upstream).await;
        info!(symbols = tracked.len(), "Kline stream running");

        self.spawn_reconciler().await;
        Ok(())
    }

    async fn stop_stream(&self) {
        if let Some(reconciler) = self.reconciler.lock().await.take() {
            reconciler.abort();
        }

        let topics = self.transport.topics().await;
        if !topics.is_empty() {
            if let Err(e) = self.transport.unsubscribe(topics).await {
                warn!(error = %e, "Unsubscribe during shutdown failed");
            }
        }
        self.transport.disconnect().await;

        let mut market = self.market.lock().await;
        market.registry.clear();
        market.windows.clear();
        market.rounds.clear();
        info!("Kline stream stopped");
    }

    async fn spawn_reconciler(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let period = self.settings.reconcile_interval.max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(e) = engine.reconcile().await {
                    warn!(error = %e, "Symbol reconciliation failed, retrying next period");
                }
            }
        });

        if let Some(previous) = self.reconciler.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn reconcile(self: &Arc<Self>) -> Result<SymbolDiff> {
        let _control = self.control.lock().await;
        if self.strategies.read().await.is_empty() {
            return Ok(SymbolDiff::default());
        }

        let upstream = self.client.get_active_symbols().await?;
        let diff = self.market.lock().await.registry.diff(&upstream);
        if diff.is_empty() {
            debug!(symbols = upstream.len(), "Symbol set unchanged");
            return Ok(diff);
        }

        if !diff.delisted.is_empty() {
            self.untrack_symbols(&diff.delisted).await;
        }
        let listed: BTreeSet<String> = self.track_symbols(diff.listed).await.into_iter().collect();

        info!(listed = ?listed, delisted = ?diff.delisted, "Symbols reconciled");
        Ok(SymbolDiff {
            listed,
            delisted: diff.delisted,
        })
    }

    /// Backfill and subscribe `symbols`. Symbols whose backfill or
    /// subscription fails are left untracked. Returns those now tracked.
    async fn track_symbols(self: &Arc<Self>, symbols: BTreeSet<String>) -> Vec<String> {
        let interval = &self.settings.interval;
        let limit = self.settings.window_capacity;

        let mut backfilled: Vec<(String, Vec<Candle>)> = stream::iter(symbols)
            .map(|symbol| async move {
                let candles = self.client.get_candles(&symbol, interval, limit).await;
                (symbol, candles)
            })
            .buffer_unordered(BACKFILL_CONCURRENCY)
            .filter_map(|(symbol, candles)| async move {
                match candles {
                    Ok(candles) => Some((symbol, candles)),
                    Err(e) => {
                        warn!(%symbol, error = %e, "Backfill failed, symbol skipped");
                        None
                    }
                }
            })
            .collect()
            .await;
        backfilled.sort_by(|a, b| a.0.cmp(&b.0));

        let handler: Arc<dyn TopicHandler> = Arc::new(KlineHandler::new(self));
        let mut tracked = Vec::new();
        let mut pending = backfilled.into_iter().peekable();

        while pending.peek().is_some() {
            let batch: Vec<(String, Vec<Candle>)> = pending.by_ref().take(CONTROL_BATCH).collect();
            let topics = batch.iter().map(|(symbol, _)| kline_topic(interval, symbol)).collect();

            let accepted = match self.transport.subscribe(topics, handler.clone()).await {
                Ok(()) => batch,
                Err(e) => {
                    // Retry one by one so a single bad symbol does not sink its batch.
                    debug!(error = %e, size = batch.len(), "Batch subscription failed");
                    let mut accepted = Vec::new();
                    for (symbol, candles) in batch {
                        let topic = kline_topic(interval, &symbol);
                        match self.transport.subscribe(vec![topic], handler.clone()).await {
                            Ok(()) => accepted.push((symbol, candles)),
                            Err(e) => warn!(%symbol, error = %e, "Subscription failed, symbol skipped"),
                        }
                    }
                    accepted
                }
            };

            let mut market = self.market.lock().await;
            for (symbol, candles) in accepted {
                let len = market.windows.init(&symbol, candles);
                market.registry.insert(symbol.clone());
                debug!(%symbol, candles = len, "Tracking symbol");
                tracked.push(symbol);
            }
        }

        tracked
    }

    /// Drop every piece of state held for `symbols`.
    async fn untrack_symbols(&self, symbols: &BTreeSet<String>) {
        let active = self.strategies.read().await.len();
        let completed = {
            let mut market = self.market.lock().await;
            for symbol in symbols {
                market.registry.remove(symbol);
                market.windows.remove(symbol);
            }
            let MarketState { registry, rounds, .. } = &mut *market;
            rounds.forget_symbols(symbols, registry.current_symbols())
        };

        let topics = symbols
            .iter()
            .map(|symbol| kline_topic(&self.settings.interval, symbol))
            .collect();
        if let Err(e) = self.transport.unsubscribe(topics).await {
            warn!(error = %e, "Unsubscribe of delisted symbols rejected");
        }
        info!(symbols = ?symbols, "Delisted symbols removed");

        if let Some(round) = completed {
            self.emit(round, active).await;
        }
    }

    async fn on_candle(&self, candle: Candle) {
        let symbol = candle.symbol.clone();
        let open_time = candle.open_time;

        let series = {
            let mut market = self.market.lock().await;
            if !market.registry.contains(&symbol) {
                debug!(%symbol, "Candle for untracked symbol dropped");
                return;
            }
            if market.windows.append(candle) == AppendOutcome::Rejected {
                return;
            }
            market.windows.snapshot(&symbol)
        };

        let active = self.strategies.read().await.snapshot();
        let signals: Vec<Signal> = active
            .iter()
            .filter_map(|strategy| strategy.generate(&symbol, &series))
            .collect();
        trace!(%symbol, open_time, signals = signals.len(), "Candle evaluated");

        let (progress, active) = {
            let strategies = self.strategies.read().await;
            // Strategies deactivated during evaluation no longer contribute.
            let signals: Vec<Signal> = signals
                .into_iter()
                .filter(|s| strategies.is_active(s.strategy_kind))
                .collect();

            let mut market = self.market.lock().await;
            let MarketState { registry, rounds, .. } = &mut *market;
            if !registry.contains(&symbol) {
                return;
            }
            (
                rounds.report(&symbol, open_time, signals, registry.current_symbols()),
                strategies.len(),
            )
        };

        match progress {
            RoundProgress::Complete(round) => self.emit(round, active).await,
            RoundProgress::Stale => debug!(%symbol, open_time, "Result for a closed round dropped"),
            RoundProgress::Pending => {}
        }
    }

    async fn emit(&self, round: RoundSignals, active: usize) {
        let aggregated = self.aggregator.aggregate(&round, active);
        if aggregated.is_empty() {
            debug!(symbols = round.len(), "Round produced no aggregated signals");
            return;
        }
        info!(count = aggregated.len(), "Emitting aggregated signals");
        self.sink.on_aggregated_signals(aggregated).await;
    }
}

/// Routes kline frames for the engine's interval into `on_candle`.
struct KlineHandler {
    id: String,
    interval: Interval,
    engine: Weak<EngineInner>,
}

impl KlineHandler {
    fn new(engine: &Arc<EngineInner>) -> Self {
        let interval = engine.settings.interval.clone();
        Self {
            id: format!("kline:{interval}"),
            interval,
            engine: Arc::downgrade(engine),
        }
    }
}

#[async_trait]
impl TopicHandler for KlineHandler {
    fn id(&self) -> &str {
        &self.id
    }

    async fn handle(&self, topic: String, data: Value) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };

        let updates = match parse_kline_data(&topic, data) {
            Ok(updates) => updates,
            Err(e) => {
                warn!(%topic, error = %e, "Skipping malformed kline");
                return;
            }
        };

        for update in updates {
            if !update.confirmed {
                continue;
            }
            if update.interval != self.interval.as_str() {
                debug!(%topic, interval = %update.interval, "Kline for another interval dropped");
                continue;
            }
            engine.on_candle(update.candle).await;
        }
    }
}
