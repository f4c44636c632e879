//! A single pooled connection
//!
//! Each [`Connection`] owns one lifecycle task. The task waits for a login,
//! connects with exponential backoff and then runs a strictly sequential
//! steady-state loop: heartbeat, subscription sync, receive. Topic bookkeeping
//! is shared with the pool behind a synchronous mutex that is never held
//! across an await.

use crate::auth::AuthProvider;
use crate::backoff::ExponentialBackoff;
use crate::client::{Frame, FrameSocket, Transport};
use crate::config::PoolConfig;
use crate::constants::LARGE_BATCH_LOG_THRESHOLD;
use crate::metrics::PoolMetrics;
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::status::{ConnectionStatus, StatusSink};
use crate::topic::{HandlerResult, Topic, TopicKey};

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, sleep, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a connection needs from its surroundings
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<PoolConfig>,
    pub transport: Arc<dyn Transport>,
    pub auth: Arc<dyn AuthProvider>,
    pub status: Arc<dyn StatusSink>,
    pub metrics: Arc<PoolMetrics>,
}

struct ConnectionState {
    topics: HashMap<TopicKey, Topic>,
    topics_changed: bool,
}

struct Shared {
    index: usize,
    ctx: ConnectionContext,
    state: Mutex<ConnectionState>,
    status_tx: watch::Sender<ConnectionStatus>,
    reconnect_requested: AtomicBool,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
        self.ctx.status.update(self.index, Some(status), None);
    }

    fn report_topics(&self, count: usize) {
        self.ctx.status.update(self.index, None, Some(count));
    }
}

struct Lifecycle {
    cancel: CancellationToken,
    exited: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    lifecycle: Option<Lifecycle>,
    removed: bool,
}

/// One WebSocket connection carrying up to `topics_per_connection` topics
pub struct Connection {
    shared: Arc<Shared>,
    control: tokio::sync::Mutex<Control>,
}

impl Connection {
    pub fn new(index: usize, ctx: ConnectionContext) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        ctx.status
            .update(index, Some(ConnectionStatus::Disconnected), Some(0));

        Self {
            shared: Arc::new(Shared {
                index,
                ctx,
                state: Mutex::new(ConnectionState {
                    topics: HashMap::new(),
                    topics_changed: false,
                }),
                status_tx,
                reconnect_requested: AtomicBool::new(false),
            }),
            control: tokio::sync::Mutex::new(Control::default()),
        }
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Start the lifecycle if it is not running and wait until connected.
    /// Returns early when the connection is stopped or gives up meanwhile.
    pub async fn start(&self) {
        let (cancel, exited) = {
            let mut control = self.control.lock().await;
            self.spawn_if_idle(&mut control)
        };

        let mut status_rx = self.shared.status_tx.subscribe();
        tokio::select! {
            _ = status_rx.wait_for(|status| *status == ConnectionStatus::Connected) => {}
            _ = cancel.cancelled() => {}
            _ = exited.cancelled() => {}
        }
    }

    /// Start the lifecycle if it is not running, without waiting for it
    pub async fn start_nowait(&self) {
        let mut control = self.control.lock().await;
        self.spawn_if_idle(&mut control);
    }

    fn spawn_if_idle(&self, control: &mut Control) -> (CancellationToken, CancellationToken) {
        if let Some(lifecycle) = &control.lifecycle
            && !lifecycle.exited.is_cancelled()
        {
            return (lifecycle.cancel.clone(), lifecycle.exited.clone());
        }

        let cancel = CancellationToken::new();
        let exited = CancellationToken::new();
        let handle = tokio::spawn(run_lifecycle(
            Arc::clone(&self.shared),
            cancel.clone(),
            exited.clone(),
        ));
        control.removed = false;
        control.lifecycle = Some(Lifecycle {
            cancel: cancel.clone(),
            exited: exited.clone(),
            handle,
        });
        (cancel, exited)
    }

    /// Stop the lifecycle, waiting at most `stop_timeout` for it to wind down.
    /// With `remove`, all topics are dropped and the slot is reported gone.
    pub async fn stop(&self, remove: bool) {
        let mut control = self.control.lock().await;
        let index = self.shared.index;

        if let Some(lifecycle) = control.lifecycle.take() {
            if !lifecycle.exited.is_cancelled() {
                self.shared.set_status(ConnectionStatus::Disconnecting);
            }
            lifecycle.cancel.cancel();

            let mut handle = lifecycle.handle;
            let stop_timeout = self.shared.ctx.config.stop_timeout;
            if timeout(stop_timeout, &mut handle).await.is_err() {
                warn!(
                    "Connection {} did not stop within {:?}, aborting",
                    index, stop_timeout
                );
                handle.abort();
                let _ = handle.await;
                self.shared.set_status(ConnectionStatus::Disconnected);
            }
        }

        if remove && !control.removed {
            control.removed = true;
            {
                let mut state = self.shared.lock_state();
                state.topics.clear();
                state.topics_changed = true;
            }
            self.shared.ctx.status.remove(index);
            debug!("Connection {} removed from the pool", index);
        }
    }

    /// Assign topics while capacity lasts. A topic whose key is already
    /// assigned replaces the stored handler. Returns the placed keys and the
    /// topics that did not fit.
    pub fn add_topics<I>(&self, topics: I) -> (Vec<TopicKey>, Vec<Topic>)
    where
        I: IntoIterator<Item = Topic>,
    {
        let capacity = self.shared.ctx.config.topics_per_connection;
        let mut placed = Vec::new();
        let mut remaining = Vec::new();

        let count = {
            let mut state = self.shared.lock_state();
            let mut inserted = false;
            for topic in topics {
                if let Some(existing) = state.topics.get_mut(topic.key()) {
                    placed.push(topic.key().clone());
                    *existing = topic;
                } else if state.topics.len() < capacity {
                    placed.push(topic.key().clone());
                    state.topics.insert(topic.key().clone(), topic);
                    inserted = true;
                } else {
                    remaining.push(topic);
                }
            }
            if inserted {
                state.topics_changed = true;
            }
            inserted.then_some(state.topics.len())
        };

        if let Some(count) = count {
            self.shared.report_topics(count);
        }
        (placed, remaining)
    }

    /// Unassign topics by key. Returns the removed keys and the keys this
    /// connection did not carry.
    pub fn remove_topics<'a, I>(&self, keys: I) -> (Vec<TopicKey>, Vec<TopicKey>)
    where
        I: IntoIterator<Item = &'a TopicKey>,
    {
        let mut removed = Vec::new();
        let mut not_found = Vec::new();

        let count = {
            let mut state = self.shared.lock_state();
            for key in keys {
                match state.topics.remove(key) {
                    Some(_) => removed.push(key.clone()),
                    None => not_found.push(key.clone()),
                }
            }
            if !removed.is_empty() {
                state.topics_changed = true;
            }
            (!removed.is_empty()).then_some(state.topics.len())
        };

        if let Some(count) = count {
            self.shared.report_topics(count);
        }
        (removed, not_found)
    }

    /// Take every assigned topic, leaving the connection empty
    pub(crate) fn drain_topics(&self) -> Vec<Topic> {
        let drained: Vec<Topic> = {
            let mut state = self.shared.lock_state();
            state.topics_changed = true;
            state.topics.drain().map(|(_, topic)| topic).collect()
        };
        self.shared.report_topics(0);
        drained
    }

    /// Drop the current socket and reconnect; a PING goes out right away on
    /// the new socket
    pub fn request_reconnect(&self) {
        self.shared.reconnect_requested.store(true, Ordering::SeqCst);
    }

    pub fn topic_count(&self) -> usize {
        self.shared.lock_state().topics.len()
    }

    pub fn topic_keys(&self) -> Vec<TopicKey> {
        let mut keys: Vec<TopicKey> = self.shared.lock_state().topics.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn has_topic(&self, key: &TopicKey) -> bool {
        self.shared.lock_state().topics.contains_key(key)
    }
}

/// Why a steady-state session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Cancelled by `stop`
    Stopped,
    Reconnect(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatAction {
    Idle,
    SendPing,
    TimedOut,
}

/// PING schedule and PONG deadline of one session
#[derive(Debug)]
struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    next_ping: Instant,
    pong_deadline: Option<Instant>,
    expired: bool,
}

impl Heartbeat {
    /// First PING is due immediately
    fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            next_ping: now,
            pong_deadline: None,
            expired: false,
        }
    }

    /// The deadline is checked first and fires once per outstanding PING
    fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if self.expired {
            return HeartbeatAction::Idle;
        }
        if let Some(deadline) = self.pong_deadline
            && now >= deadline
        {
            self.expired = true;
            return HeartbeatAction::TimedOut;
        }
        if now >= self.next_ping {
            self.next_ping = now + self.interval;
            self.pong_deadline.get_or_insert(now + self.timeout);
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::Idle
    }

    fn on_pong(&mut self) {
        self.pong_deadline = None;
    }
}

/// LISTEN/UNLISTEN work needed to move the server's view to the local one
#[derive(Debug, Default, PartialEq, Eq)]
struct SubscriptionDiff {
    added: Vec<TopicKey>,
    removed: Vec<TopicKey>,
}

impl SubscriptionDiff {
    fn between(submitted: &BTreeSet<TopicKey>, current: &BTreeSet<TopicKey>) -> Self {
        Self {
            added: current.difference(submitted).cloned().collect(),
            removed: submitted.difference(current).cloned().collect(),
        }
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

type HandlerSet = JoinSet<(TopicKey, HandlerResult)>;

async fn run_lifecycle(shared: Arc<Shared>, cancel: CancellationToken, exited: CancellationToken) {
    let _exit_guard = exited.drop_guard();
    let index = shared.index;
    let config = Arc::clone(&shared.ctx.config);
    let mut handlers = HandlerSet::new();

    shared.set_status(ConnectionStatus::Initializing);
    tokio::select! {
        _ = shared.ctx.auth.wait_until_login() => {}
        _ = cancel.cancelled() => {
            shared.set_status(ConnectionStatus::Disconnected);
            return;
        }
    }
    shared.set_status(ConnectionStatus::Connecting);
    info!("Connection {} connecting...", index);

    let mut backoff = ExponentialBackoff::new(config.backoff_min, config.backoff_max);
    while let Some(mut socket) = connect_with_backoff(&shared, &cancel, &mut backoff).await {
        backoff.reset();
        shared.ctx.metrics.record_connected(index).await;
        shared.reconnect_requested.store(false, Ordering::SeqCst);
        shared.lock_state().topics_changed = true;
        shared.set_status(ConnectionStatus::Connected);
        info!("Connection {} connected", index);

        let end = Session::new(&shared, socket.as_mut(), &cancel, &mut handlers)
            .run()
            .await;
        shared.lock_state().topics_changed = true;

        match end {
            SessionEnd::Stopped => {
                let deadline = Instant::now() + config.stop_timeout;
                if let Ok(Err(e)) = timeout_at(deadline, socket.close()).await {
                    debug!("Connection {} close failed: {}", index, e);
                }
                drain_handlers(&shared, &mut handlers, deadline).await;
                info!("Connection {} stopped", index);
                break;
            }
            SessionEnd::Reconnect(reason) => {
                warn!("Connection {} reconnecting: {}", index, reason);
                shared.ctx.metrics.record_reconnect(index).await;
                shared.set_status(ConnectionStatus::Reconnecting);
                let _ = timeout(config.stop_timeout, socket.close()).await;
            }
        }
    }

    if !handlers.is_empty() {
        drain_handlers(&shared, &mut handlers, Instant::now() + config.stop_timeout).await;
    }
    shared.set_status(ConnectionStatus::Disconnected);
}

/// Retry transient connect failures forever; `None` when cancelled or on a
/// failure retrying cannot fix
async fn connect_with_backoff(
    shared: &Shared,
    cancel: &CancellationToken,
    backoff: &mut ExponentialBackoff,
) -> Option<Box<dyn FrameSocket>> {
    let index = shared.index;
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return None,
            attempt = shared.ctx.transport.connect() => attempt,
        };

        match attempt {
            Ok(socket) => return Some(socket),
            Err(e) if e.is_transient() => {
                let delay = backoff.next().unwrap_or_else(|| backoff.max_delay());
                info!(
                    "Connection {} connection problem: {} (sleep: {}s)",
                    index,
                    e,
                    delay.as_secs_f64().round()
                );
                shared.ctx.metrics.record_connect_failure(index).await;
                shared.set_status(ConnectionStatus::Reconnecting);

                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = sleep(delay) => {}
                }
                shared.set_status(ConnectionStatus::Connecting);
            }
            Err(e) => {
                error!("Connection {} giving up: {}", index, e);
                return None;
            }
        }
    }
}

async fn drain_handlers(shared: &Shared, handlers: &mut HandlerSet, deadline: Instant) {
    loop {
        match timeout_at(deadline, handlers.join_next()).await {
            Ok(Some(result)) => log_handler_result(shared, result).await,
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "Connection {} aborting {} unfinished handler(s)",
                    shared.index,
                    handlers.len()
                );
                handlers.abort_all();
                break;
            }
        }
    }
}

async fn log_handler_result(
    shared: &Shared,
    result: std::result::Result<(TopicKey, HandlerResult), JoinError>,
) {
    let index = shared.index;
    match result {
        Ok((_, Ok(()))) => {}
        Ok((topic, Err(e))) => {
            warn!("Connection {} handler for {} failed: {}", index, topic, e);
            shared.ctx.metrics.record_handler_failure(index).await;
        }
        Err(e) if e.is_panic() => {
            error!("Connection {} handler panicked: {}", index, e);
            shared.ctx.metrics.record_handler_failure(index).await;
        }
        Err(_) => {}
    }
}

/// Steady state of one established socket
struct Session<'a> {
    shared: &'a Shared,
    socket: &'a mut dyn FrameSocket,
    cancel: &'a CancellationToken,
    handlers: &'a mut HandlerSet,
    heartbeat: Heartbeat,
    submitted: BTreeSet<TopicKey>,
}

impl<'a> Session<'a> {
    fn new(
        shared: &'a Shared,
        socket: &'a mut dyn FrameSocket,
        cancel: &'a CancellationToken,
        handlers: &'a mut HandlerSet,
    ) -> Self {
        let config = &shared.ctx.config;
        Self {
            shared,
            socket,
            cancel,
            handlers,
            heartbeat: Heartbeat::new(
                config.heartbeat_interval,
                config.heartbeat_timeout,
                Instant::now(),
            ),
            submitted: BTreeSet::new(),
        }
    }

    async fn run(mut self) -> SessionEnd {
        loop {
            if let Err(end) = self.step().await {
                return end;
            }
        }
    }

    async fn step(&mut self) -> Result<(), SessionEnd> {
        if self.cancel.is_cancelled() {
            return Err(SessionEnd::Stopped);
        }
        if self.shared.reconnect_requested.swap(false, Ordering::SeqCst) {
            return Err(SessionEnd::Reconnect("reconnect requested".to_string()));
        }
        self.reap_handlers().await;
        self.tick_heartbeat().await?;
        self.sync_topics().await?;
        self.receive().await
    }

    async fn reap_handlers(&mut self) {
        while let Some(result) = self.handlers.try_join_next() {
            log_handler_result(self.shared, result).await;
        }
    }

    async fn tick_heartbeat(&mut self) -> Result<(), SessionEnd> {
        match self.heartbeat.poll(Instant::now()) {
            HeartbeatAction::Idle => Ok(()),
            HeartbeatAction::SendPing => {
                self.send(OutboundMessage::Ping).await?;
                self.shared.ctx.metrics.record_ping();
                Ok(())
            }
            HeartbeatAction::TimedOut => {
                warn!(
                    "Connection {} didn't receive a PONG, reconnecting...",
                    self.shared.index
                );
                Err(SessionEnd::Reconnect("PONG timeout".to_string()))
            }
        }
    }

    async fn sync_topics(&mut self) -> Result<(), SessionEnd> {
        let current: BTreeSet<TopicKey> = {
            let mut state = self.shared.lock_state();
            if !state.topics_changed {
                return Ok(());
            }
            state.topics_changed = false;
            state.topics.keys().cloned().collect()
        };
        self.shared.report_topics(current.len());

        let diff = SubscriptionDiff::between(&self.submitted, &current);
        if diff.is_empty() {
            return Ok(());
        }

        let auth = tokio::select! {
            auth = self.shared.ctx.auth.get_auth() => auth,
            _ = self.cancel.cancelled() => return Err(SessionEnd::Stopped),
        };
        let shared = self.shared;
        let index = shared.index;
        let metrics = &shared.ctx.metrics;

        if !diff.removed.is_empty() {
            debug!(
                "Connection {} removing topics: {}",
                index,
                join_keys(&diff.removed)
            );
            let count = diff.removed.len();
            self.send(OutboundMessage::unlisten(diff.removed.clone(), &auth.access_token))
                .await?;
            metrics.record_unlisten(index, count).await;
            for key in &diff.removed {
                self.submitted.remove(key);
            }
        }

        if !diff.added.is_empty() {
            debug!(
                "Connection {} adding topics: {}",
                index,
                join_keys(&diff.added)
            );
            let count = diff.added.len();
            self.send(OutboundMessage::listen(diff.added.clone(), &auth.access_token))
                .await?;
            metrics.record_listen(index, count).await;
            self.submitted.extend(diff.added);
        }

        Ok(())
    }

    async fn send(&mut self, message: OutboundMessage) -> Result<(), SessionEnd> {
        let text = message
            .to_text()
            .map_err(|e| SessionEnd::Reconnect(e.to_string()))?;
        debug!("Connection {} sending {}", self.shared.index, message.kind());
        self.socket
            .send(Frame::Text(text))
            .await
            .map_err(|e| SessionEnd::Reconnect(format!("send failed: {}", e)))
    }

    /// Gather frames for one receive window, then handle them in order
    async fn receive(&mut self) -> Result<(), SessionEnd> {
        let deadline = Instant::now() + self.shared.ctx.config.recv_timeout;
        let mut frames = Vec::new();
        let mut ended = None;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SessionEnd::Stopped),
                _ = sleep_until(deadline) => break,
                received = self.socket.recv() => match received {
                    Ok(Some(Frame::Close(reason))) => {
                        ended = Some(SessionEnd::Reconnect(format!(
                            "closed by server ({})",
                            reason.as_deref().unwrap_or("no reason")
                        )));
                        break;
                    }
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => {
                        ended = Some(if self.cancel.is_cancelled() {
                            SessionEnd::Stopped
                        } else {
                            SessionEnd::Reconnect("stream ended".to_string())
                        });
                        break;
                    }
                    Err(e) => {
                        ended = Some(SessionEnd::Reconnect(format!("receive failed: {}", e)));
                        break;
                    }
                },
            }
        }

        if frames.len() > LARGE_BATCH_LOG_THRESHOLD {
            debug!(
                "Connection {} processing {} messages",
                self.shared.index,
                frames.len()
            );
        }
        for frame in frames {
            self.handle_frame(frame).await?;
        }

        match ended {
            Some(end) => Err(end),
            None => Ok(()),
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), SessionEnd> {
        let shared = self.shared;
        let index = shared.index;
        let metrics = &shared.ctx.metrics;
        metrics.record_frame_received(index).await;

        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(bytes) => {
                debug!("Connection {} ignoring {} byte binary frame", index, bytes.len());
                return Ok(());
            }
            Frame::Close(_) => return Ok(()),
        };
        debug!("Connection {} received: {}", index, text);

        match InboundMessage::decode(&text) {
            Ok(InboundMessage::Message { data }) => {
                let topic = shared.lock_state().topics.get(&data.topic).cloned();
                let Some(topic) = topic else {
                    debug!("Connection {} has no handler for {}", index, data.topic);
                    return Ok(());
                };
                match data.decode_payload() {
                    Ok(payload) => self.dispatch(topic, payload).await,
                    Err(e) => {
                        warn!("Connection {} dropping message: {}", index, e);
                        metrics.record_malformed(index).await;
                    }
                }
            }
            Ok(InboundMessage::Pong) => {
                self.heartbeat.on_pong();
                metrics.record_pong();
            }
            Ok(InboundMessage::Response { nonce, error }) => match error.as_deref() {
                Some(error) if !error.is_empty() => {
                    warn!(
                        "Connection {} request {} failed: {}",
                        index,
                        nonce.as_deref().unwrap_or("-"),
                        error
                    );
                }
                _ => debug!(
                    "Connection {} request {} acknowledged",
                    index,
                    nonce.as_deref().unwrap_or("-")
                ),
            },
            Ok(InboundMessage::Reconnect) => {
                warn!("Connection {} requested reconnect", index);
                return Err(SessionEnd::Reconnect("server requested reconnect".to_string()));
            }
            Ok(InboundMessage::Unknown) => {
                let kind = serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_default();
                warn!("Connection {} unknown message type: {}", index, kind);
                metrics.record_unknown();
            }
            Err(e) => {
                warn!("Connection {} ignoring frame: {}", index, e);
                metrics.record_malformed(index).await;
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, topic: Topic, payload: Value) {
        self.shared
            .ctx
            .metrics
            .record_dispatch(self.shared.index)
            .await;
        let key = topic.key().clone();
        self.handlers
            .spawn(async move { (key, topic.dispatch(payload).await) });
    }
}

fn join_keys(keys: &[TopicKey]) -> String {
    keys.iter()
        .map(TopicKey::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::client::mock::MockTransport;
    use crate::errors::PoolError;
    use crate::status::recording::RecordingStatusSink;
    use crate::topic::HandlerError;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn secs(n: f64) -> Duration {
        Duration::from_secs_f64(n)
    }

    fn context(
        transport: Arc<MockTransport>,
        auth: Arc<StaticAuth>,
        config: PoolConfig,
    ) -> (ConnectionContext, Arc<RecordingStatusSink>, Arc<PoolMetrics>) {
        let status = Arc::new(RecordingStatusSink::default());
        let metrics = Arc::new(PoolMetrics::new());
        let ctx = ConnectionContext {
            config: Arc::new(config),
            transport,
            auth,
            status: status.clone(),
            metrics: metrics.clone(),
        };
        (ctx, status, metrics)
    }

    fn noop_topic(key: &str) -> Topic {
        Topic::new(key, |_payload: Value| async { Ok::<(), HandlerError>(()) })
    }

    fn channel_topic(key: &str) -> (Topic, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = Topic::new(key, move |payload: Value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload);
                Ok::<(), HandlerError>(())
            }
        });
        (topic, rx)
    }

    fn listened(frames: &[Value]) -> Vec<String> {
        frames
            .iter()
            .flat_map(|f| f["data"]["topics"].as_array().cloned().unwrap_or_default())
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_heartbeat_times_out_once() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(secs(1.0), secs(1.0), start);

        let actions: Vec<HeartbeatAction> = (0..=5)
            .map(|step| heartbeat.poll(start + secs(step as f64 * 0.5)))
            .collect();

        assert_eq!(actions[0], HeartbeatAction::SendPing);
        assert_eq!(
            actions
                .iter()
                .filter(|a| **a == HeartbeatAction::TimedOut)
                .count(),
            1
        );
        assert_eq!(actions[2], HeartbeatAction::TimedOut);
    }

    #[test]
    fn test_heartbeat_pong_clears_deadline() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(secs(1.0), secs(0.5), start);

        assert_eq!(heartbeat.poll(start), HeartbeatAction::SendPing);
        heartbeat.on_pong();
        assert_eq!(heartbeat.poll(start + secs(0.75)), HeartbeatAction::Idle);
        assert_eq!(heartbeat.poll(start + secs(1.0)), HeartbeatAction::SendPing);
        assert_eq!(heartbeat.poll(start + secs(1.5)), HeartbeatAction::TimedOut);
    }

    #[test]
    fn test_subscription_diff() {
        let submitted: BTreeSet<TopicKey> = ["a", "b"].into_iter().map(TopicKey::from).collect();
        let current: BTreeSet<TopicKey> = ["b", "c"].into_iter().map(TopicKey::from).collect();

        let diff = SubscriptionDiff::between(&submitted, &current);
        assert_eq!(diff.added, vec![TopicKey::from("c")]);
        assert_eq!(diff.removed, vec![TopicKey::from("a")]);
        assert!(SubscriptionDiff::between(&current, &current).is_empty());
    }

    #[tokio::test]
    async fn test_add_topics_respects_capacity() {
        let (ctx, status, _) = context(
            MockTransport::new(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::sized(2, 1),
        );
        let connection = Connection::new(0, ctx);

        let (placed, remaining) =
            connection.add_topics(vec![noop_topic("a"), noop_topic("b"), noop_topic("c")]);
        assert_eq!(placed.len(), 2);
        assert_eq!(remaining.len(), 1);
        assert_eq!(connection.topic_count(), 2);
        assert_eq!(status.topics.lock().unwrap().get(&0), Some(&2));

        // An assigned key only swaps its handler
        let (placed, remaining) = connection.add_topics(vec![noop_topic("a")]);
        assert_eq!(placed, vec![TopicKey::from("a")]);
        assert!(remaining.is_empty());

        let (removed, not_found) =
            connection.remove_topics(&[TopicKey::from("a"), TopicKey::from("zzz")]);
        assert_eq!(removed, vec![TopicKey::from("a")]);
        assert_eq!(not_found, vec![TopicKey::from("zzz")]);
        assert_eq!(connection.topic_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_pings_and_listens() {
        let transport = MockTransport::new();
        let (ctx, status, metrics) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token-1", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(3, ctx);
        connection.add_topics(vec![noop_topic("video-playback-by-id.1")]);

        connection.start().await;
        assert!(connection.is_connected());
        sleep(secs(1.0)).await;

        let sent = transport.sent(0);
        assert!(sent[0].contains("PING"));
        let listens = transport.sent_of_kind("LISTEN");
        assert_eq!(listens.len(), 1);
        assert_eq!(listened(&listens), vec!["video-playback-by-id.1"]);
        assert_eq!(listens[0]["data"]["auth_token"], "token-1");
        assert_eq!(
            status.statuses(3)[..4],
            [
                ConnectionStatus::Disconnected,
                ConnectionStatus::Initializing,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected
            ]
        );
        assert_eq!(metrics.snapshot().pongs, 1);

        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_then_remove_before_sync_sends_nothing() {
        let transport = MockTransport::new();
        let (ctx, _, _) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(0, ctx);
        connection.start().await;

        connection.add_topics(vec![noop_topic("a")]);
        connection.remove_topics(&[TopicKey::from("a")]);
        sleep(secs(2.0)).await;

        assert_eq!(transport.count_kind("LISTEN"), 0);
        assert_eq!(transport.count_kind("UNLISTEN"), 0);
        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlisten_after_removal() {
        let transport = MockTransport::new();
        let (ctx, _, _) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(0, ctx);
        connection.add_topics(vec![noop_topic("a"), noop_topic("b")]);
        connection.start().await;
        sleep(secs(1.0)).await;

        connection.remove_topics(&[TopicKey::from("b")]);
        sleep(secs(1.0)).await;

        let unlistens = transport.sent_of_kind("UNLISTEN");
        assert_eq!(unlistens.len(), 1);
        assert_eq!(listened(&unlistens), vec!["b"]);
        assert_eq!(transport.count_kind("LISTEN"), 1);
        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resends_listen() {
        let transport = MockTransport::new();
        let (ctx, status, metrics) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(0, ctx);
        connection.add_topics(vec![noop_topic("a"), noop_topic("b")]);
        connection.start().await;
        sleep(secs(1.0)).await;

        transport.push_json(0, json!({"type": "RECONNECT"}));
        transport.wait_for_connects(2).await;
        sleep(secs(1.0)).await;

        let second = transport.sent(1);
        assert!(second[0].contains("PING"));
        let listens: Vec<Value> = second
            .iter()
            .filter_map(|t| serde_json::from_str::<Value>(t).ok())
            .filter(|v| v["type"] == "LISTEN")
            .collect();
        assert_eq!(listened(&listens), vec!["a", "b"]);
        assert!(transport.is_closed(0));
        assert_eq!(metrics.snapshot().reconnects, 1);
        assert!(status.statuses(0).contains(&ConnectionStatus::Reconnecting));
        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_timeout_reconnects_once() {
        let transport = MockTransport::new();
        let config = PoolConfig {
            heartbeat_interval: secs(1.0),
            heartbeat_timeout: secs(1.0),
            ..PoolConfig::default()
        };
        let (ctx, _, metrics) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            config,
        );
        let connection = Connection::new(0, ctx);

        transport.set_silent(true);
        connection.start().await;
        transport.set_silent(false);
        sleep(secs(2.5)).await;

        assert_eq!(metrics.snapshot().reconnects, 1);
        assert_eq!(transport.connects(), 2);
        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_and_stream_errors_reconnect() {
        let transport = MockTransport::new();
        let (ctx, _, metrics) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(0, ctx);
        connection.start().await;

        transport.push_frame(0, Frame::Close(Some("1011 going away".to_string())));
        transport.wait_for_connects(2).await;
        transport.fail_stream(1);
        transport.wait_for_connects(3).await;
        transport.end_stream(2);
        transport.wait_for_connects(4).await;

        assert_eq!(metrics.snapshot().reconnects, 3);
        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_and_malformed_frames() {
        let transport = MockTransport::new();
        let (ctx, _, metrics) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(0, ctx);
        let (topic, mut payloads) = channel_topic("video-playback-by-id.7");
        let failing = Topic::new("user-drop-events.7", |_payload: Value| async {
            Err::<(), HandlerError>("handler blew up".into())
        });
        connection.add_topics(vec![topic, failing]);
        connection.start().await;

        transport.push_message(0, "video-playback-by-id.7", r#"{"type":"viewcount","viewers":12}"#);
        transport.push_message(0, "video-playback-by-id.7", "{not json");
        transport.push_message(0, "user-drop-events.7", "{}");
        transport.push_message(0, "unassigned.1", "{}");
        transport.push_frame(0, Frame::Text("definitely not json".to_string()));
        transport.push_frame(0, Frame::Binary(vec![1, 2, 3]));
        transport.push_json(0, json!({"type": "RESPONSE", "nonce": "n", "error": "ERR_BADAUTH"}));
        transport.push_json(0, json!({"type": "SOMETHING_NEW"}));

        let payload = payloads.recv().await.unwrap();
        assert_eq!(payload["viewers"], 12);
        sleep(secs(2.0)).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_dispatched, 2);
        assert_eq!(snapshot.malformed_messages, 2);
        assert_eq!(snapshot.handler_failures, 1);
        assert_eq!(snapshot.unknown_messages, 1);
        assert_eq!(snapshot.reconnects, 0);
        assert!(payloads.try_recv().is_err());
        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_panic_is_isolated() {
        let transport = MockTransport::new();
        let (ctx, _, metrics) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(0, ctx);
        let panicking = Topic::new("a", |_payload: Value| async {
            if true {
                panic!("handler panic");
            }
            Ok::<(), HandlerError>(())
        });
        connection.add_topics(vec![panicking]);
        connection.start().await;

        transport.push_message(0, "a", "{}");
        sleep(secs(2.0)).await;

        assert!(connection.is_connected());
        assert_eq!(metrics.snapshot().handler_failures, 1);
        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_read_at_send_time() {
        let transport = MockTransport::new();
        let auth = Arc::new(StaticAuth::new("old-token", "1"));
        let (ctx, _, _) = context(transport.clone(), auth.clone(), PoolConfig::default());
        let connection = Connection::new(0, ctx);
        connection.add_topics(vec![noop_topic("a")]);
        connection.start().await;
        sleep(secs(1.0)).await;

        auth.rotate_token("new-token");
        connection.add_topics(vec![noop_topic("b")]);
        sleep(secs(1.0)).await;

        let listens = transport.sent_of_kind("LISTEN");
        assert_eq!(listens.len(), 2);
        assert_eq!(listens[0]["data"]["auth_token"], "old-token");
        assert_eq!(listens[1]["data"]["auth_token"], "new-token");
        assert_eq!(listened(&listens[1..]), vec!["b"]);
        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_login() {
        let transport = MockTransport::new();
        let auth = Arc::new(StaticAuth::logged_out());
        let (ctx, status, _) = context(transport.clone(), auth.clone(), PoolConfig::default());
        let connection = Connection::new(0, ctx);

        connection.start_nowait().await;
        sleep(secs(5.0)).await;
        assert_eq!(transport.attempts(), 0);
        assert_eq!(status.last(0), Some(ConnectionStatus::Initializing));

        auth.rotate_token("late-token");
        transport.wait_for_connects(1).await;
        connection.stop(false).await;
        assert_eq!(status.last(0), Some(ConnectionStatus::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_back_off() {
        let transport = MockTransport::new();
        transport.fail_next(2);
        let (ctx, _, metrics) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(0, ctx);

        let started = Instant::now();
        connection.start().await;

        assert!(connection.is_connected());
        assert_eq!(transport.attempts(), 3);
        assert_eq!(metrics.snapshot().connect_failures, 2);
        // 1s, then roughly 2s
        assert!(started.elapsed() >= secs(3.0));
        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbled_handshake_is_retried() {
        let transport = MockTransport::new();
        transport.fail_next_with(PoolError::Protocol(
            "Invalid proxy status line 'garbage'".to_string(),
        ));
        let (ctx, _, metrics) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(0, ctx);
        connection.add_topics(vec![noop_topic("a")]);

        timeout(secs(10.0), connection.start())
            .await
            .expect("connection gave up");

        assert!(connection.is_connected());
        assert_eq!(transport.attempts(), 2);
        assert_eq!(metrics.snapshot().connect_failures, 1);
        connection.stop(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let transport = MockTransport::new();
        let (ctx, status, _) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(5, ctx);
        connection.add_topics(vec![noop_topic("a")]);
        connection.start().await;

        connection.stop(false).await;
        connection.stop(false).await;
        assert_eq!(status.last(5), Some(ConnectionStatus::Disconnected));
        assert!(transport.is_closed(0));
        assert_eq!(connection.topic_count(), 1);

        connection.stop(true).await;
        connection.stop(true).await;
        assert_eq!(*status.removed.lock().unwrap(), vec![5]);
        assert_eq!(connection.topic_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_reconnect() {
        let transport = MockTransport::new();
        let (ctx, _, metrics) = context(
            transport.clone(),
            Arc::new(StaticAuth::new("token", "1")),
            PoolConfig::default(),
        );
        let connection = Connection::new(0, ctx);
        connection.start().await;

        connection.request_reconnect();
        transport.wait_for_connects(2).await;
        sleep(secs(1.0)).await;

        assert_eq!(metrics.snapshot().reconnects, 1);
        assert!(transport.sent(1)[0].contains("PING"));
        connection.stop(false).await;
    }
}
