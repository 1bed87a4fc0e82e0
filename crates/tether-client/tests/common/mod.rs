//! Scripted in-process transport shared by the session integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_client::ConnectionState;
use tether_types::schema::LATEST_PROTOCOL_VERSION;
use tether_types::{
    BoxFuture, MessageStream, Outlet, StateStream, Transport, TransportError, TransportState,
};
use tokio::sync::{Notify, broadcast};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// How the mock answers a client request.
pub enum Reply {
    Result(Value),
    Error(i64, String),
    Silent,
}

type Responder = Box<dyn Fn(&Value) -> Reply + Send + Sync>;

/// A transport that records outbound messages and answers requests from
/// per-method scripts. `initialize` and `ping` are answered by default.
pub struct MockTransport {
    states: Outlet<TransportState>,
    inbound: Outlet<Bytes>,
    sent: Mutex<Vec<Value>>,
    sent_notify: Notify,
    responders: Mutex<HashMap<String, Responder>>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    failing_connects: AtomicUsize,
    fail_sends: AtomicBool,
    persistent: bool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_persistence(true))
    }

    pub fn non_persistent() -> Arc<Self> {
        Arc::new(Self::with_persistence(false))
    }

    fn with_persistence(persistent: bool) -> Self {
        let transport = Self {
            states: Outlet::new(),
            inbound: Outlet::new(),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
            responders: Mutex::new(HashMap::new()),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            persistent,
        };
        transport.respond("initialize", |_| Reply::Result(initialize_result(LATEST_PROTOCOL_VERSION)));
        transport.respond("ping", |_| Reply::Result(json!({})));
        transport
    }

    /// Script the reply to every request for `method`.
    pub fn respond(&self, method: &str, responder: impl Fn(&Value) -> Reply + Send + Sync + 'static) {
        self.responders
            .lock()
            .unwrap()
            .insert(method.to_string(), Box::new(responder));
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Deliver a message as if the server sent it.
    pub fn inject(&self, message: Value) {
        self.inject_raw(Bytes::from(message.to_string()));
    }

    pub fn inject_raw(&self, frame: Bytes) {
        self.inbound.emit(frame);
    }

    /// Report the link as up again, as a flapping transport would.
    pub fn report_connected(&self) {
        self.states.emit(TransportState::Connected);
    }

    /// Report an unexpected connection loss.
    pub fn drop_connection(&self, error: TransportError) {
        self.states.emit(TransportState::Disconnected(Some(error)));
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    /// Outbound requests and notifications for `method`.
    pub fn sent_with_method(&self, method: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|m| m["method"] == method)
            .collect()
    }

    /// Wait until at least `count` outbound messages satisfy `matches`.
    pub async fn wait_for_sent(
        &self,
        count: usize,
        matches: impl Fn(&Value) -> bool,
    ) -> Vec<Value> {
        let wait = async {
            loop {
                let notified = self.sent_notify.notified();
                let found: Vec<Value> = self.sent().into_iter().filter(|m| matches(m)).collect();
                if found.len() >= count {
                    return found;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("timed out waiting for outbound messages")
    }

    /// Wait for `count` requests for `method`.
    pub async fn wait_for_requests(&self, method: &str, count: usize) -> Vec<Value> {
        self.wait_for_sent(count, |m| m["method"] == method && m.get("id").is_some())
            .await
    }

    /// Wait for the client's reply to the server request `id`.
    pub async fn wait_for_reply(&self, id: Value) -> Value {
        let mut replies = self
            .wait_for_sent(1, |m| m["id"] == id && m.get("method").is_none())
            .await;
        replies.remove(0)
    }
}

impl Transport for MockTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            self.states.emit(TransportState::Connecting);
            let failing = self.failing_connects.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_connects.store(failing - 1, Ordering::SeqCst);
                return Err(TransportError::Other("connection refused".into()));
            }
            self.states.emit(TransportState::Connected);
            Ok(())
        })
    }

    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            let message: Value = serde_json::from_slice(&message)
                .map_err(|e| TransportError::Other(e.to_string()))?;
            self.sent.lock().unwrap().push(message.clone());
            self.sent_notify.notify_waiters();

            let (Some(id), Some(method)) = (
                message.get("id"),
                message.get("method").and_then(Value::as_str),
            ) else {
                return Ok(());
            };
            let reply = self
                .responders
                .lock()
                .unwrap()
                .get(method)
                .map(|respond| respond(&message));
            match reply {
                Some(Reply::Result(result)) => {
                    self.inject(json!({"jsonrpc": "2.0", "id": id, "result": result}))
                }
                Some(Reply::Error(code, text)) => self.inject(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": code, "message": text}
                })),
                Some(Reply::Silent) | None => {}
            }
            Ok(())
        })
    }

    fn incoming(&self) -> MessageStream {
        self.inbound.subscribe()
    }

    fn state_changes(&self) -> StateStream {
        self.states.subscribe()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            self.states.emit(TransportState::Disconnected(None));
            self.states.close();
            self.inbound.close();
        })
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn initialize_result(protocol_version: &str) -> Value {
    json!({
        "protocolVersion": protocol_version,
        "capabilities": {"tools": {"listChanged": true}, "logging": {}},
        "serverInfo": {"name": "mock-server", "version": "1.0.0"}
    })
}

/// Collect transitions up to and including the first one matching `stop`.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<ConnectionState>,
    stop: impl Fn(&ConnectionState) -> bool,
) -> Vec<ConnectionState> {
    let collect = async {
        let mut seen = Vec::new();
        loop {
            let state = rx.recv().await.expect("transition channel closed");
            let done = stop(&state);
            seen.push(state);
            if done {
                return seen;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), collect)
        .await
        .expect("timed out waiting for transition")
}

/// Attempt numbers of the `Reconnecting` states in `states`.
pub fn reconnect_attempts(states: &[ConnectionState]) -> Vec<u32> {
    states
        .iter()
        .filter_map(|s| match s {
            ConnectionState::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect()
}
