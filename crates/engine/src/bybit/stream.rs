use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use common::{Config, Error, Result};

use super::protocol::{control_frame, decode, ping_frame, Ack, Inbound, Op, CONTROL_BATCH};

pub type WsSink = Pin<Box<dyn Sink<Message, Error = Error> + Send>>;
pub type WsSource = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// Opens one WebSocket connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(WsSink, WsSource)>;
}

/// Production connector over `tokio-tungstenite`.
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<(WsSink, WsSource)> {
        let url = Url::parse(url).map_err(|e| Error::WebSocket(e.to_string()))?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let (write, read) = ws_stream.split();
        let sink = write.sink_map_err(|e| Error::WebSocket(e.to_string()));
        let source = read.map(|msg| msg.map_err(|e| Error::WebSocket(e.to_string())));
        Ok((Box::pin(sink), Box::pin(source)))
    }
}

/// Receives data frames for the topics it was subscribed with.
///
/// Each frame is handled on its own task. Handlers sharing an `id` form one
/// group and are resubscribed together after a reconnect.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    fn id(&self) -> &str;
    async fn handle(&self, topic: String, data: Value);
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub ack_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub max_connect_attempts: u32,
    pub queue_capacity: usize,
}

impl StreamConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            url: cfg.ws_url.clone(),
            ping_interval: Duration::from_secs(cfg.ping_interval_secs),
            read_timeout: Duration::from_secs(cfg.read_timeout_secs),
            ack_timeout: Duration::from_secs(cfg.ack_timeout_secs),
            reconnect_backoff: Duration::from_secs(cfg.reconnect_backoff_secs),
            max_connect_attempts: cfg.max_connect_attempts,
            queue_capacity: cfg.inbound_queue_capacity,
        }
    }
}

/// Multiplexed public stream: one connection, many topics, one handler per topic.
///
/// `connect` starts a receive loop that owns the socket. It keeps the
/// connection alive with pings, reconnects with a fixed backoff whenever the
/// connection is lost and resubscribes every routed topic before reading
/// new data. Data frames pass through a bounded overwrite-oldest queue to a
/// dispatcher that spawns one task per frame.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: StreamConfig,
    connector: Arc<dyn Connector>,
    routes: RwLock<HashMap<String, Arc<dyn TopicHandler>>>,
    session: Mutex<Option<Session>>,
    next_req_id: AtomicU64,
    connected: AtomicBool,
}

struct Session {
    control_tx: mpsc::UnboundedSender<ControlRequest>,
    shutdown_tx: watch::Sender<bool>,
    receive_loop: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

struct ControlRequest {
    op: Op,
    topics: Vec<String>,
    reply: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Clone)]
struct Frame {
    topic: String,
    data: Value,
}

impl StreamTransport {
    pub fn new(cfg: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                connector,
                routes: RwLock::new(HashMap::new()),
                session: Mutex::new(None),
                next_req_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
            }),
        }
    }

    /// Open the connection and start the receive loop. No-op when running.
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        if session.as_ref().map_or(false, |s| !s.receive_loop.is_finished()) {
            return Ok(());
        }

        let connection = self.connect_with_retries().await?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = broadcast::channel(self.inner.cfg.queue_capacity.max(1));

        let dispatcher = tokio::spawn(dispatch(self.inner.clone(), queue_rx));
        let receive_loop = tokio::spawn(receive_loop(
            self.inner.clone(),
            connection,
            control_rx,
            shutdown_rx,
            queue_tx,
        ));

        *session = Some(Session {
            control_tx,
            shutdown_tx,
            receive_loop,
            dispatcher,
        });
        info!(url = %self.inner.cfg.url, "Stream connected");
        Ok(())
    }

    async fn connect_with_retries(&self) -> Result<(WsSink, WsSource)> {
        let max = self.inner.cfg.max_connect_attempts.max(1);
        let mut reason = String::new();

        for attempt in 1..=max {
            match self.inner.connector.connect(&self.inner.cfg.url).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(attempt, max, error = %e, "Stream connect failed");
                    reason = e.to_string();
                    if attempt < max {
                        sleep(self.inner.cfg.reconnect_backoff).await;
                    }
                }
            }
        }

        Err(Error::ConnectFailed {
            attempts: max,
            reason,
        })
    }

    /// Route `topics` to `handler` and subscribe them upstream.
    ///
    /// Connects first when needed. A rejected chunk rolls back the routes
    /// changed by this call, restoring any handler it replaced, and returns
    /// `SubscriptionRejected`. A missing
    /// acknowledgement is transient: the routes stay and the next reconnect
    /// resubscribes them.
    pub async fn subscribe(&self, topics: Vec<String>, handler: Arc<dyn TopicHandler>) -> Result<()> {
        let topics = unique(topics);
        if topics.is_empty() {
            return Ok(());
        }
        self.connect().await?;

        let mut added = HashSet::new();
        let mut replaced: Vec<(String, Arc<dyn TopicHandler>)> = Vec::new();
        {
            let mut routes = self.inner.routes.write().await;
            for topic in &topics {
                match routes.insert(topic.clone(), handler.clone()) {
                    None => {
                        added.insert(topic.clone());
                    }
                    Some(previous) => replaced.push((topic.clone(), previous)),
                }
            }
        }

        let mut confirmed: Vec<String> = Vec::new();
        for chunk in topics.chunks(CONTROL_BATCH) {
            if let Err(e) = self.request(Op::Subscribe, chunk.to_vec()).await {
                {
                    let mut routes = self.inner.routes.write().await;
                    for topic in &added {
                        routes.remove(topic);
                    }
                    routes.extend(replaced);
                }
                let rollback: Vec<String> = confirmed.into_iter().filter(|t| added.contains(t)).collect();
                for chunk in rollback.chunks(CONTROL_BATCH) {
                    if let Err(e) = self.request(Op::Unsubscribe, chunk.to_vec()).await {
                        debug!(error = %e, "Rollback unsubscribe failed");
                    }
                }
                return Err(e);
            }
            confirmed.extend_from_slice(chunk);
        }

        debug!(handler = %handler.id(), topics = topics.len(), "Subscribed");
        Ok(())
    }

    /// Drop the routes for `topics` and unsubscribe them if a session is up.
    /// Routes are removed even when the exchange rejects the request.
    pub async fn unsubscribe(&self, topics: Vec<String>) -> Result<()> {
        let topics = unique(topics);
        {
            let mut routes = self.inner.routes.write().await;
            for topic in &topics {
                routes.remove(topic);
            }
        }

        let mut result = Ok(());
        for chunk in topics.chunks(CONTROL_BATCH) {
            if let Err(e) = self.request(Op::Unsubscribe, chunk.to_vec()).await {
                warn!(error = %e, "Unsubscribe rejected");
                result = Err(e);
            }
        }
        result
    }

    /// Stop the receive loop, including any reconnect backoff in progress.
    pub async fn disconnect(&self) {
        let Some(session) = self.inner.session.lock().await.take() else {
            return;
        };

        let _ = session.shutdown_tx.send(true);
        let mut receive_loop = session.receive_loop;
        if timeout(Duration::from_secs(5), &mut receive_loop).await.is_err() {
            warn!("Receive loop did not stop in time, aborting");
            receive_loop.abort();
        }
        session.dispatcher.abort();
        self.inner.connected.store(false, Ordering::SeqCst);
        info!("Stream disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Routed topics, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.routes.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Send one control request to the receive loop and wait for its ack.
    async fn request(&self, op: Op, topics: Vec<String>) -> Result<()> {
        let control_tx = match self.inner.session.lock().await.as_ref() {
            Some(session) => session.control_tx.clone(),
            None => return Ok(()),
        };

        let (reply, ack) = oneshot::channel();
        if control_tx.send(ControlRequest { op, topics, reply }).is_err() {
            warn!(%op, "Receive loop is not running, request dropped");
            return Ok(());
        }

        match timeout(self.inner.cfg.ack_timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!(%op, "Connection dropped before acknowledgement");
                Ok(())
            }
            Err(_) => {
                warn!(%op, timeout = ?self.inner.cfg.ack_timeout, "No acknowledgement received");
                Ok(())
            }
        }
    }
}

impl Inner {
    fn next_req_id(&self) -> String {
        self.next_req_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Routed topics grouped by handler id.
    async fn route_groups(&self) -> BTreeMap<String, Vec<String>> {
        let routes = self.routes.read().await;
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (topic, handler) in routes.iter() {
            groups.entry(handler.id().to_string()).or_default().push(topic.clone());
        }
        for topics in groups.values_mut() {
            topics.sort();
        }
        groups
    }
}

fn unique(topics: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    topics.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

// ─── Receive loop ─────────────────────────────────────────────────────────────

enum Outcome {
    Shutdown,
    Lost(String),
}

struct PendingAck {
    op: Op,
    topics: Vec<String>,
    reply: Option<oneshot::Sender<Result<()>>>,
}

async fn receive_loop(
    inner: Arc<Inner>,
    first: (WsSink, WsSource),
    mut control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
    queue: broadcast::Sender<Frame>,
) {
    let mut next = Some(first);

    loop {
        let (sink, source) = match next.take() {
            Some(connection) => connection,
            None => match reconnect(&inner, &mut shutdown_rx).await {
                Some(connection) => connection,
                None => break,
            },
        };

        inner.connected.store(true, Ordering::SeqCst);
        let outcome = drive(&inner, sink, source, &mut control_rx, &mut shutdown_rx, &queue).await;
        inner.connected.store(false, Ordering::SeqCst);

        match outcome {
            Outcome::Shutdown => break,
            Outcome::Lost(reason) => warn!(%reason, "Stream connection lost"),
        }
    }

    debug!("Receive loop stopped");
}

/// Reconnect with a fixed backoff until it succeeds or shutdown is signalled.
async fn reconnect(inner: &Inner, shutdown_rx: &mut watch::Receiver<bool>) -> Option<(WsSink, WsSource)> {
    let mut attempt: u64 = 0;
    loop {
        if *shutdown_rx.borrow() {
            return None;
        }
        tokio::select! {
            _ = shutdown_rx.changed() => return None,
            _ = sleep(inner.cfg.reconnect_backoff) => {}
        }

        attempt += 1;
        info!(attempt, "Reconnecting stream");
        match inner.connector.connect(&inner.cfg.url).await {
            Ok(connection) => return Some(connection),
            Err(e) => warn!(attempt, error = %e, "Reconnect failed"),
        }
    }
}

/// Run one connection until it is lost or shutdown is signalled.
async fn drive(
    inner: &Inner,
    mut sink: WsSink,
    mut source: WsSource,
    control_rx: &mut mpsc::UnboundedReceiver<ControlRequest>,
    shutdown_rx: &mut watch::Receiver<bool>,
    queue: &broadcast::Sender<Frame>,
) -> Outcome {
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut pending: HashMap<String, PendingAck> = HashMap::new();

    // Every routed topic is resubscribed before the first read.
    for (handler, topics) in inner.route_groups().await {
        for chunk in topics.chunks(CONTROL_BATCH) {
            let req_id = inner.next_req_id();
            if let Err(e) = send_control(&mut sink, &req_id, Op::Subscribe, chunk).await {
                return Outcome::Lost(e.to_string());
            }
            subscribed.extend(chunk.iter().cloned());
            pending.insert(
                req_id,
                PendingAck {
                    op: Op::Subscribe,
                    topics: chunk.to_vec(),
                    reply: None,
                },
            );
        }
        info!(%handler, topics = topics.len(), "Topic group resubscribed");
    }

    let ping_every = inner.cfg.ping_interval;
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    let mut last_frame = Instant::now();

    loop {
        let read_deadline = last_frame + inner.cfg.read_timeout;

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Outcome::Shutdown;
            }

            request = control_rx.recv() => {
                let Some(request) = request else {
                    return Outcome::Shutdown;
                };
                if let Err(e) = handle_control(inner, &mut sink, request, &mut subscribed, &mut pending).await {
                    return Outcome::Lost(e.to_string());
                }
            }

            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Text(ping_frame().to_string())).await {
                    return Outcome::Lost(e.to_string());
                }
                trace!("Ping sent");
            }

            _ = sleep_until(read_deadline) => {
                return Outcome::Lost(format!("no frame within {:?}", inner.cfg.read_timeout));
            }

            message = source.next() => {
                last_frame = Instant::now();
                match message {
                    Some(Ok(Message::Text(text))) => {
                        on_text(&text, &mut subscribed, &mut pending, queue);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            return Outcome::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Outcome::Lost(format!("closed by peer: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Outcome::Lost(e.to_string()),
                    None => return Outcome::Lost("stream ended".to_string()),
                }
            }
        }
    }
}

async fn send_control(sink: &mut WsSink, req_id: &str, op: Op, topics: &[String]) -> Result<()> {
    let frame = control_frame(req_id, op, topics)?;
    sink.send(Message::Text(frame)).await
}

async fn handle_control(
    inner: &Inner,
    sink: &mut WsSink,
    request: ControlRequest,
    subscribed: &mut HashSet<String>,
    pending: &mut HashMap<String, PendingAck>,
) -> Result<()> {
    let ControlRequest { op, topics, reply } = request;

    // Reconnect resubscription may already cover these topics.
    let topics: Vec<String> = match op {
        Op::Subscribe => topics.into_iter().filter(|t| !subscribed.contains(t)).collect(),
        Op::Unsubscribe => topics.into_iter().filter(|t| subscribed.contains(t)).collect(),
    };
    if topics.is_empty() {
        let _ = reply.send(Ok(()));
        return Ok(());
    }

    let req_id = inner.next_req_id();
    send_control(sink, &req_id, op, &topics).await?;

    match op {
        Op::Subscribe => subscribed.extend(topics.iter().cloned()),
        Op::Unsubscribe => {
            for topic in &topics {
                subscribed.remove(topic);
            }
        }
    }
    pending.insert(
        req_id,
        PendingAck {
            op,
            topics,
            reply: Some(reply),
        },
    );
    Ok(())
}

fn on_text(
    text: &str,
    subscribed: &mut HashSet<String>,
    pending: &mut HashMap<String, PendingAck>,
    queue: &broadcast::Sender<Frame>,
) {
    match decode(text) {
        Ok(Inbound::Ack(ack)) => on_ack(ack, subscribed, pending),
        Ok(Inbound::Data { topic, data }) => {
            // Err only means the dispatcher is gone.
            let _ = queue.send(Frame { topic, data });
        }
        Ok(Inbound::Other) => trace!("Ignoring frame: {text}"),
        Err(e) => warn!(error = %e, "Skipping malformed frame"),
    }
}

fn on_ack(ack: Ack, subscribed: &mut HashSet<String>, pending: &mut HashMap<String, PendingAck>) {
    let Some(request) = pending.remove(&ack.req_id) else {
        trace!(op = %ack.op, "Unmatched acknowledgement");
        return;
    };

    if ack.success {
        if let Some(reply) = request.reply {
            let _ = reply.send(Ok(()));
        }
        return;
    }

    match request.op {
        Op::Subscribe => {
            for topic in &request.topics {
                subscribed.remove(topic);
            }
        }
        Op::Unsubscribe => subscribed.extend(request.topics.iter().cloned()),
    }
    warn!(op = %request.op, topics = ?request.topics, reason = %ack.ret_msg, "Request rejected");

    if let Some(reply) = request.reply {
        let _ = reply.send(Err(Error::SubscriptionRejected {
            op: request.op.to_string(),
            reason: ack.ret_msg,
        }));
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

async fn dispatch(inner: Arc<Inner>, mut queue: broadcast::Receiver<Frame>) {
    loop {
        match queue.recv().await {
            Ok(Frame { topic, data }) => {
                let handler = inner.routes.read().await.get(&topic).cloned();
                match handler {
                    Some(handler) => {
                        tokio::spawn(async move { handler.handle(topic, data).await });
                    }
                    None => debug!(%topic, "No handler for topic, frame dropped"),
                }
            }
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                warn!(dropped, "Inbound queue full, oldest frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_stream_config, MockConnector, RecordingHandler};
    use serde_json::json;

    async fn connected(
        cfg: StreamConfig,
    ) -> (StreamTransport, Arc<MockConnector>, mpsc::UnboundedReceiver<crate::testing::MockPeer>) {
        let (connector, peers) = MockConnector::new();
        let transport = StreamTransport::new(cfg, connector.clone());
        transport.connect().await.unwrap();
        (transport, connector, peers)
    }

    fn kline_frame(topic: &str) -> String {
        json!({
            "topic": topic,
            "type": "snapshot",
            "ts": 1,
            "data": [{"start": 1, "confirm": true}]
        })
        .to_string()
    }

    #[tokio::test]
    async fn reconnect_resubscribes_every_group_before_routing_data() {
        let (transport, _connector, mut peers) = connected(test_stream_config()).await;
        let first = crate::testing::next_peer(&mut peers).await;
        let (first, _log) = first.auto_ack();

        let (tx, mut received) = mpsc::unbounded_channel();
        for group in ["a", "b", "c"] {
            let topics = vec![format!("kline.60.{group}1"), format!("kline.60.{group}2")];
            transport
                .subscribe(topics, RecordingHandler::new(group, tx.clone()))
                .await
                .unwrap();
        }
        assert_eq!(transport.topics().await.len(), 6);

        first.close();
        let mut second = crate::testing::next_peer(&mut peers).await;
        // Data queued on the new socket before anything was read from it.
        second.handle.push_text(kline_frame("kline.60.b1"));

        let (topic, _) = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, "kline.60.b1");

        let mut resubscribed = Vec::new();
        let mut frames = 0;
        while let Ok(msg) = second.from_client.try_recv() {
            if let Message::Text(text) = msg {
                let v: Value = serde_json::from_str(&text).unwrap();
                if v["op"] == "subscribe" {
                    frames += 1;
                    for t in v["args"].as_array().unwrap() {
                        resubscribed.push(t.as_str().unwrap().to_string());
                    }
                }
            }
        }
        resubscribed.sort();
        assert_eq!(frames, 3);
        assert_eq!(resubscribed, transport.topics().await);

        transport.disconnect().await;
    }

    #[tokio::test]
    async fn rejected_subscription_rolls_back_routes() {
        let (transport, _connector, mut peers) = connected(test_stream_config()).await;
        let peer = crate::testing::next_peer(&mut peers).await;
        let (_peer, _log) = peer.auto_ack_with(|topic| !topic.ends_with("NOPE"));

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport
            .subscribe(vec!["kline.60.NOPE".into()], RecordingHandler::new("k", tx))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SubscriptionRejected { ref op, .. } if op == "subscribe"));
        assert!(transport.topics().await.is_empty());
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn large_subscriptions_are_split_into_batches() {
        let (transport, _connector, mut peers) = connected(test_stream_config()).await;
        let (_peer, log) = crate::testing::next_peer(&mut peers).await.auto_ack();

        let topics: Vec<String> = (0..25).map(|i| format!("kline.60.S{i}USDT")).collect();
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.subscribe(topics, RecordingHandler::new("k", tx)).await.unwrap();

        let sizes: Vec<usize> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v["op"] == "subscribe")
            .map(|v| v["args"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn initial_connect_gives_up_after_max_attempts() {
        let (connector, _peers) = MockConnector::failing(u32::MAX);
        let cfg = StreamConfig {
            max_connect_attempts: 3,
            ..test_stream_config()
        };
        let transport = StreamTransport::new(cfg, connector.clone());

        match transport.connect().await {
            Err(Error::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
        assert_eq!(connector.attempts(), 3);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn malformed_and_unrouted_frames_are_skipped() {
        let (transport, _connector, mut peers) = connected(test_stream_config()).await;
        let (peer, _log) = crate::testing::next_peer(&mut peers).await.auto_ack();

        let (tx, mut received) = mpsc::unbounded_channel();
        transport
            .subscribe(vec!["kline.60.BTCUSDT".into()], RecordingHandler::new("k", tx))
            .await
            .unwrap();

        peer.push_text("{not json");
        peer.push_text(kline_frame("kline.60.UNKNOWN"));
        peer.push_text(kline_frame("kline.60.BTCUSDT"));

        let (topic, data) = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, "kline.60.BTCUSDT");
        assert!(data.is_array());
        assert!(transport.is_connected());
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn silent_connection_is_replaced() {
        let cfg = StreamConfig {
            read_timeout: Duration::from_millis(100),
            ..test_stream_config()
        };
        let (transport, connector, mut peers) = connected(cfg).await;
        let _first = crate::testing::next_peer(&mut peers).await;

        let _second = crate::testing::next_peer(&mut peers).await;
        assert_eq!(connector.attempts(), 2);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_stops_the_loop_and_keeps_routes_local() {
        let (transport, _connector, mut peers) = connected(test_stream_config()).await;
        let (_peer, log) = crate::testing::next_peer(&mut peers).await.auto_ack();
        let (tx, _rx) = mpsc::unbounded_channel();
        transport
            .subscribe(vec!["kline.60.BTCUSDT".into()], RecordingHandler::new("k", tx))
            .await
            .unwrap();

        transport.disconnect().await;
        assert!(!transport.is_connected());

        let sent_before = log.lock().unwrap().len();
        transport.unsubscribe(vec!["kline.60.BTCUSDT".into()]).await.unwrap();
        assert!(transport.topics().await.is_empty());
        assert_eq!(log.lock().unwrap().len(), sent_before);
    }

    #[tokio::test]
    async fn rejected_subscription_restores_replaced_handler() {
        let (transport, _connector, mut peers) = connected(test_stream_config()).await;
        let (peer, _log) = crate::testing::next_peer(&mut peers)
            .await
            .auto_ack_with(|topic| !topic.ends_with("NOPE"));

        let (tx_a, mut received_a) = mpsc::unbounded_channel();
        transport
            .subscribe(vec!["kline.60.BTCUSDT".into()], RecordingHandler::new("a", tx_a))
            .await
            .unwrap();

        let (tx_b, mut received_b) = mpsc::unbounded_channel();
        let err = transport
            .subscribe(
                vec!["kline.60.BTCUSDT".into(), "kline.60.NOPE".into()],
                RecordingHandler::new("b", tx_b),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubscriptionRejected { .. }));
        assert_eq!(transport.topics().await, vec!["kline.60.BTCUSDT".to_string()]);

        peer.push_text(kline_frame("kline.60.BTCUSDT"));
        let (topic, _) = tokio::time::timeout(Duration::from_secs(5), received_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, "kline.60.BTCUSDT");
        assert!(received_b.try_recv().is_err());
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_frames_and_keeps_routing() {
        let cfg = StreamConfig {
            queue_capacity: 4,
            ..test_stream_config()
        };
        let (transport, _connector, mut peers) = connected(cfg).await;
        let (peer, _log) = crate::testing::next_peer(&mut peers).await.auto_ack();

        let topics: Vec<String> = (0..12).map(|i| format!("kline.60.S{i}USDT")).collect();
        let (tx, mut received) = mpsc::unbounded_channel();
        transport
            .subscribe(topics.clone(), RecordingHandler::new("k", tx))
            .await
            .unwrap();

        // Stall the dispatcher on the route table while frames pile up.
        let routes = transport.inner.routes.write().await;
        for topic in &topics {
            peer.push_text(kline_frame(topic));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(routes);

        let mut delivered = Vec::new();
        while let Ok(Some((topic, _))) =
            tokio::time::timeout(Duration::from_millis(300), received.recv()).await
        {
            delivered.push(topic);
        }

        assert!(delivered.contains(&"kline.60.S11USDT".to_string()), "got {delivered:?}");
        assert!(delivered.len() <= 5, "got {delivered:?}");

        // Routing continues once the backlog is gone.
        peer.push_text(kline_frame("kline.60.S3USDT"));
        let (topic, _) = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, "kline.60.S3USDT");
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_interrupts_reconnect_backoff() {
        let cfg = StreamConfig {
            reconnect_backoff: Duration::from_millis(50),
            ..test_stream_config()
        };
        let (transport, connector, mut peers) = connected(cfg).await;
        let (peer, _log) = crate::testing::next_peer(&mut peers).await.auto_ack();

        connector.fail_next(u32::MAX);
        peer.close();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!transport.is_connected());
        assert!(connector.attempts() > 1);

        tokio::time::timeout(Duration::from_secs(1), transport.disconnect())
            .await
            .expect("disconnect returns promptly");
        let after = connector.attempts();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.attempts(), after);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn reconnect_after_loss_ignores_max_connect_attempts() {
        let cfg = StreamConfig {
            max_connect_attempts: 3,
            ..test_stream_config()
        };
        let (transport, connector, mut peers) = connected(cfg).await;
        let (peer, _log) = crate::testing::next_peer(&mut peers).await.auto_ack();

        connector.fail_next(5);
        peer.close();

        let _second = crate::testing::next_peer(&mut peers).await;
        assert_eq!(connector.attempts(), 1 + 5 + 1);
        transport.disconnect().await;
    }
}
