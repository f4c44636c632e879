//! In-memory transport for exercising connections without a network

use crate::client::{Frame, FrameSocket, Transport};
use crate::errors::{PoolError, Result};

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type Inbound = Result<Option<Frame>>;

struct MockSession {
    sent: Arc<Mutex<Vec<String>>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct MockState {
    attempts: usize,
    failures: VecDeque<PoolError>,
    silent: bool,
    sessions: Vec<MockSession>,
}

/// Scripted transport; every successful connect opens a new numbered session
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` connect attempts fail with a transient error
    pub fn fail_next(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.failures = (0..n)
            .map(|_| PoolError::transport("mock connect failure"))
            .collect();
    }

    /// Queue one connect failure with a specific error
    pub fn fail_next_with(&self, err: PoolError) {
        self.state.lock().unwrap().failures.push_back(err);
    }

    /// Sockets opened from now on never answer PING
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// Text frames sent on session `index`
    pub fn sent(&self, index: usize) -> Vec<String> {
        self.state.lock().unwrap().sessions[index]
            .sent
            .lock()
            .unwrap()
            .clone()
    }

    /// Sent frames of one `type` across all sessions, decoded
    pub fn sent_of_kind(&self, kind: &str) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .iter()
            .flat_map(|s| s.sent.lock().unwrap().clone())
            .filter_map(|text| serde_json::from_str::<Value>(&text).ok())
            .filter(|v| v["type"] == kind)
            .collect()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.sent_of_kind(kind).len()
    }

    pub fn is_closed(&self, index: usize) -> bool {
        self.state.lock().unwrap().sessions[index]
            .closed
            .load(Ordering::SeqCst)
    }

    fn push(&self, index: usize, item: Inbound) {
        let state = self.state.lock().unwrap();
        let _ = state.sessions[index].inbound.send(item);
    }

    pub fn push_frame(&self, index: usize, frame: Frame) {
        self.push(index, Ok(Some(frame)));
    }

    pub fn push_json(&self, index: usize, value: Value) {
        self.push_frame(index, Frame::Text(value.to_string()));
    }

    /// Push a `MESSAGE` frame; `message` is the raw payload string
    pub fn push_message(&self, index: usize, topic: &str, message: &str) {
        self.push_json(
            index,
            json!({"type": "MESSAGE", "data": {"topic": topic, "message": message}}),
        );
    }

    pub fn end_stream(&self, index: usize) {
        self.push(index, Ok(None));
    }

    pub fn fail_stream(&self, index: usize) {
        self.push(index, Err(PoolError::transport("connection reset by peer")));
    }

    /// Poll until at least `n` sessions were opened
    pub async fn wait_for_connects(&self, n: usize) {
        while self.connects() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<Box<dyn FrameSocket>> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let (inbound, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        state.sessions.push(MockSession {
            sent: Arc::clone(&sent),
            inbound,
            closed: Arc::clone(&closed),
        });

        Ok(Box::new(MockSocket {
            sent,
            inbound: rx,
            pending: VecDeque::new(),
            auto_pong: !state.silent,
            closed,
        }))
    }
}

pub struct MockSocket {
    sent: Arc<Mutex<Vec<String>>>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    pending: VecDeque<Frame>,
    auto_pong: bool,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSocket for MockSocket {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::transport("socket closed"));
        }
        if let Frame::Text(text) = frame {
            if self.auto_pong && text.contains(r#""type":"PING""#) {
                self.pending
                    .push_back(Frame::Text(r#"{"type":"PONG"}"#.to_string()));
            }
            self.sent.lock().unwrap().push(text);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        match self.inbound.recv().await {
            Some(item) => item,
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
