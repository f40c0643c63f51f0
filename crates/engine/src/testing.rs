//! In-memory collaborators for transport and engine tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{sink, stream};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use common::{AggregatedSignal, Candle, Error, Interval, MarketDataClient, Result, SignalSink};

use crate::bybit::{Connector, StreamConfig, TopicHandler, WsSink, WsSource};

pub fn test_stream_config() -> StreamConfig {
    StreamConfig {
        url: "wss://stream.test/v5/public/linear".to_string(),
        ping_interval: Duration::from_secs(30),
        read_timeout: Duration::from_secs(30),
        ack_timeout: Duration::from_secs(2),
        reconnect_backoff: Duration::from_millis(10),
        max_connect_attempts: 3,
        queue_capacity: 64,
    }
}

pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
    tokio::time::timeout(Duration::from_secs(5), peers.recv())
        .await
        .expect("no connection within 5s")
        .expect("connector dropped")
}

// ─── Connector ────────────────────────────────────────────────────────────────

/// Hands every successful connection to the test as a `MockPeer`.
pub struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        Self::failing(0)
    }

    /// Refuses the first `failures` connection attempts.
    pub fn failing(failures: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        });
        (connector, rx)
    }

    /// Refuse the next `failures` connection attempts.
    pub fn fail_next(&self, failures: u32) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<(WsSink, WsSource)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::WebSocket("connection refused".to_string()));
        }

        let (client_tx, from_client) = mpsc::unbounded_channel::<Message>();
        let (to_client, client_rx) = mpsc::unbounded_channel::<Result<Message>>();

        let sink = sink::unfold(client_tx, |tx, msg: Message| async move {
            tx.send(msg)
                .map_err(|_| Error::WebSocket("peer went away".to_string()))?;
            Ok::<_, Error>(tx)
        });
        let source = stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        let _ = self.peers.send(MockPeer {
            from_client,
            handle: PeerHandle { to_client },
        });
        Ok((Box::pin(sink), Box::pin(source)))
    }
}

/// Server side of one mock connection.
pub struct MockPeer {
    pub from_client: mpsc::UnboundedReceiver<Message>,
    pub handle: PeerHandle,
}

pub type ControlLog = Arc<StdMutex<Vec<Value>>>;

impl MockPeer {
    /// Acknowledge every control frame with success.
    pub fn auto_ack(self) -> (PeerHandle, ControlLog) {
        self.auto_ack_with(|_| true)
    }

    /// Acknowledge control frames, rejecting any frame with a topic `accept`
    /// refuses. Returns the log of control frames received.
    pub fn auto_ack_with(self, accept: impl Fn(&str) -> bool + Send + 'static) -> (PeerHandle, ControlLog) {
        let MockPeer { mut from_client, handle } = self;
        let log: ControlLog = Arc::default();

        let replies = handle.clone();
        let frames = log.clone();
        tokio::spawn(async move {
            while let Some(msg) = from_client.recv().await {
                let Message::Text(text) = msg else { continue };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };

                if frame["op"] == "ping" {
                    replies.push_text(json!({"success": true, "ret_msg": "pong", "op": "ping"}).to_string());
                    continue;
                }

                let accepted = frame["args"]
                    .as_array()
                    .map_or(true, |args| args.iter().filter_map(Value::as_str).all(&accept));
                frames.lock().unwrap().push(frame.clone());
                replies.ack(&frame, accepted);
            }
        });

        (handle, log)
    }
}

#[derive(Clone)]
pub struct PeerHandle {
    to_client: mpsc::UnboundedSender<Result<Message>>,
}

impl PeerHandle {
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.to_client.send(Ok(Message::Text(text.into())));
    }

    pub fn ack(&self, request: &Value, success: bool) {
        let ret_msg = if success { "" } else { "error:handler not found" };
        let op = request["op"].clone();
        let req_id = request["req_id"].clone();
        self.push_text(
            json!({
                "success": success,
                "ret_msg": ret_msg,
                "op": op,
                "req_id": req_id,
            })
            .to_string(),
        );
    }

    pub fn push_kline(&self, topic: &str, open_time: i64, close: f64, confirm: bool) {
        let price = close.to_string();
        self.push_text(
            json!({
                "topic": topic,
                "type": "snapshot",
                "ts": open_time,
                "data": [{
                    "start": open_time,
                    "end": open_time + 3_599_999,
                    "interval": "60",
                    "open": price,
                    "close": price,
                    "high": price,
                    "low": price,
                    "volume": "100",
                    "turnover": "10000",
                    "confirm": confirm,
                    "timestamp": open_time
                }]
            })
            .to_string(),
        );
    }

    pub fn close(&self) {
        let _ = self.to_client.send(Ok(Message::Close(None)));
    }
}

// ─── Handlers and collaborators ───────────────────────────────────────────────

pub struct RecordingHandler {
    id: String,
    tx: mpsc::UnboundedSender<(String, Value)>,
}

impl RecordingHandler {
    pub fn new(id: &str, tx: mpsc::UnboundedSender<(String, Value)>) -> Arc<Self> {
        Arc::new(Self { id: id.to_string(), tx })
    }
}

#[async_trait]
impl TopicHandler for RecordingHandler {
    fn id(&self) -> &str {
        &self.id
    }

    async fn handle(&self, topic: String, data: Value) {
        let _ = self.tx.send((topic, data));
    }
}

/// Serves a fixed close series per symbol as hourly candles starting at
/// open_time 1h.
pub struct MockMarketData {
    pub symbols: StdMutex<BTreeSet<String>>,
    pub closes: Vec<f64>,
}

impl MockMarketData {
    pub fn new(symbols: &[&str], closes: Vec<f64>) -> Arc<Self> {
        Arc::new(Self {
            symbols: StdMutex::new(symbols.iter().map(|s| s.to_string()).collect()),
            closes,
        })
    }

    pub fn set_symbols(&self, symbols: &[&str]) {
        *self.symbols.lock().unwrap() = symbols.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait]
impl MarketDataClient for MockMarketData {
    async fn get_candles(&self, symbol: &str, interval: &Interval, limit: usize) -> Result<Vec<Candle>> {
        let skip = self.closes.len().saturating_sub(limit);
        Ok(self
            .closes
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(i, &close)| Candle {
                symbol: symbol.to_string(),
                open_time: (i as i64 + 1) * interval.millis(),
                open: close,
                high: close,
                low: close,
                close,
                volume: 100.0,
                turnover: close * 100.0,
            })
            .collect())
    }

    async fn get_active_symbols(&self) -> Result<BTreeSet<String>> {
        Ok(self.symbols.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct CollectingSink {
    pub batches: StdMutex<Vec<Vec<AggregatedSignal>>>,
}

#[async_trait]
impl SignalSink for CollectingSink {
    async fn on_aggregated_signals(&self, signals: Vec<AggregatedSignal>) {
        self.batches.lock().unwrap().push(signals);
    }
}
