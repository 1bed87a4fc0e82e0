//! The session state machine.
//!
//! An [`McpClient`] owns one transport and at most one live connection.
//! Each connection cycle runs a small set of tasks, all tied to a
//! per-cycle [`CancellationToken`]:
//!
//! - the transport-state observer, which starts the handshake and reacts
//!   to transport failures,
//! - the inbound loop, the single ordered consumer of inbound frames,
//! - the handshake, then the heartbeat once connected.
//!
//! The reconnection loop lives across cycles and has its own token.
//!
//! All shared state sits in one `Mutex<Session>`. The lock is never held
//! across an `.await`; every transition is published while it is held so
//! observers see transitions in mutation order. Tasks carry the generation
//! of the cycle that spawned them and become no-ops once it is stale.

use crate::config::ClientConfig;
use crate::error::McpError;
use crate::handler::{NotificationHandler, RequestHandlers};
use crate::pending::{CallOutcome, PendingCall, PendingTable};
use crate::state::ConnectionState;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_types::jsonrpc::ResponsePayload;
use tether_types::schema::{
    CancelledParams, InitializeParams, InitializeResult, SUPPORTED_PROTOCOL_VERSIONS,
    ServerCapabilities,
};
use tether_types::{
    ErrorObject, JsonRpcErrorResponse, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, MessageStream, RequestId, StateStream, Transport, TransportError,
    TransportState,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Buffered transitions per [`McpClient::transitions`] receiver.
const TRANSITION_CAPACITY: usize = 64;

/// Client for one MCP server connection. Cheap to clone; clones share the
/// same session.
///
/// Background tasks keep the session alive while connected, so call
/// [`disconnect`](Self::disconnect) when done.
#[derive(Clone)]
pub struct McpClient {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    notifications: Arc<dyn NotificationHandler>,
    requests: RequestHandlers,
    session: Mutex<Session>,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    next_id: AtomicI64,
}

#[derive(Default)]
struct Session {
    connection: ConnectionState,
    /// Bumped on every connect; tasks from older cycles see a mismatch.
    generation: u64,
    /// Cancels the observer, inbound loop, handshake, and heartbeat.
    cycle: Option<CancellationToken>,
    pending: PendingTable,
    server: Option<InitializeResult>,
    handshaking: bool,
    reconnect_attempt: u32,
    reconnect: Option<ReconnectTask>,
    /// Set by `disconnect()` and by exhausted retries; cleared by `connect()`.
    reconnect_paused: bool,
}

struct ReconnectTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReconnectTask {
    fn cancel(self) {
        self.token.cancel();
    }

    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Which connection states a request may be sent in.
#[derive(Debug, Clone, Copy)]
enum Admission {
    Connected,
    /// Only the `initialize` call of the given cycle, while still connecting.
    Handshake(u64),
}

impl McpClient {
    pub(crate) fn from_parts(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        notifications: Arc<dyn NotificationHandler>,
        requests: RequestHandlers,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                notifications,
                requests,
                session: Mutex::new(Session::default()),
                state_tx,
                transitions,
                next_id: AtomicI64::new(1),
            }),
        }
    }

    /// Start a connection cycle.
    ///
    /// Returns once the transport-level connect call finishes; the
    /// handshake completes asynchronously. Use
    /// [`wait_until_connected`](Self::wait_until_connected) to wait for it.
    /// Cancels any in-flight reconnection loop and re-arms automatic
    /// reconnection.
    pub async fn connect(&self) -> Result<(), McpError> {
        {
            let mut session = self.inner.lock();
            if let Some(task) = session.reconnect.take() {
                task.cancel();
            }
            session.reconnect_paused = false;
            session.reconnect_attempt = 0;
        }
        self.inner.open(None).await
    }

    /// [`connect`](Self::connect), then wait for the handshake.
    pub async fn connect_and_wait(&self) -> Result<(), McpError> {
        self.connect().await?;
        self.wait_until_connected().await
    }

    /// Wait until the session is `Connected`, or fail with the error that
    /// ended the attempt.
    pub async fn wait_until_connected(&self) -> Result<(), McpError> {
        let mut rx = self.inner.state_tx.subscribe();
        let settled = rx
            .wait_for(|s| s.is_connected() || s.is_disconnected())
            .await
            .map(|s| s.clone());
        match settled {
            Ok(ConnectionState::Connected) => Ok(()),
            Ok(ConnectionState::Disconnected(Some(err))) => Err(err),
            _ => Err(McpError::NotConnected),
        }
    }

    /// Close the connection, failing pending calls with `Cancelled`.
    ///
    /// Idempotent. Also stops any reconnection loop; automatic
    /// reconnection stays off until the next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        self.inner.shutdown(None).await;
    }

    /// Like [`disconnect`](Self::disconnect), but publishes `reason` as the
    /// terminal state.
    pub async fn disconnect_with(&self, reason: McpError) {
        self.inner.shutdown(Some(reason)).await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().connection.clone()
    }

    /// Watch the latest connection state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Receive every state transition from now on, in order.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.transitions.subscribe()
    }

    /// Handshake result of the current connection.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.inner.lock().server.clone()
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.inner
            .lock()
            .server
            .as_ref()
            .map(|s| s.capabilities.clone())
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Current reconnection attempt (0 when not reconnecting).
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().reconnect_attempt
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    /// Send a request and decode its result into `R`.
    ///
    /// `params` serializing to `null` (e.g. `()`) are omitted from the envelope.
    pub async fn send_request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> Result<R, McpError> {
        let params = encode_params(params)?;
        let result = self
            .inner
            .call(
                method,
                params,
                Admission::Connected,
                std::any::type_name::<R>(),
            )
            .await?;
        serde_json::from_value(result).map_err(McpError::decoding)
    }

    /// Send a notification. Requires a connected session.
    pub async fn notify(&self, method: &str, params: impl Serialize) -> Result<(), McpError> {
        let frame = encode_notification(method, encode_params(params)?)?;
        if !self.inner.lock().connection.is_connected() {
            return Err(McpError::NotConnected);
        }
        self.inner.transport.send(frame).await?;
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, session: &mut Session, state: ConnectionState) {
        tracing::debug!("MCP session '{}' -> {state}", self.transport.name());
        session.connection = state.clone();
        self.state_tx.send_replace(state.clone());
        let _ = self.transitions.send(state);
    }

    // -- lifecycle ---------------------------------------------------------

    /// Begin a connection cycle. `retry` is the reconnection loop's token,
    /// checked under the lock so a cancelled loop never opens a cycle.
    async fn open(self: &Arc<Self>, retry: Option<&CancellationToken>) -> Result<(), McpError> {
        let (generation, cycle) = {
            let mut session = self.lock();
            if matches!(
                session.connection,
                ConnectionState::Connected
                    | ConnectionState::Connecting
                    | ConnectionState::Disconnecting
            ) {
                return Err(McpError::AlreadyConnected);
            }
            if retry.is_some_and(CancellationToken::is_cancelled) {
                return Err(McpError::Cancelled);
            }
            session.generation += 1;
            let cycle = CancellationToken::new();
            session.cycle = Some(cycle.clone());
            session.handshaking = false;
            self.publish(&mut session, ConnectionState::Connecting);
            (session.generation, cycle)
        };

        // Subscribe before connecting so no transition is missed.
        let states = self.transport.state_changes();
        let incoming = self.transport.incoming();
        tokio::spawn(Arc::clone(self).observe_transport(generation, cycle.clone(), states));
        tokio::spawn(Arc::clone(self).read_inbound(cycle, incoming));

        if let Err(e) = self.transport.connect().await {
            let err = McpError::Transport(e);
            self.fail_connection(generation, err.clone()).await;
            return Err(err);
        }
        Ok(())
    }

    /// Set `Disconnecting`, stop the cycle's tasks, and retire every pending
    /// call. The caller resolves the returned calls outside the lock.
    fn begin_teardown(&self, session: &mut Session) -> Vec<PendingCall> {
        self.publish(session, ConnectionState::Disconnecting);
        if let Some(cycle) = session.cycle.take() {
            cycle.cancel();
        }
        session.server = None;
        session.handshaking = false;
        session.pending.drain()
    }

    /// Tear down the connection of `generation` after a failure, then
    /// schedule reconnection if enabled. No-op if that cycle already ended.
    async fn fail_connection(self: &Arc<Self>, generation: u64, err: McpError) {
        let calls = {
            let mut session = self.lock();
            if session.generation != generation
                || !matches!(
                    session.connection,
                    ConnectionState::Connecting | ConnectionState::Connected
                )
            {
                return;
            }
            tracing::warn!("MCP connection via '{}' failed: {err}", self.transport.name());
            self.begin_teardown(&mut session)
        };
        for call in calls {
            call.resolve(Err(err.clone()));
        }

        self.transport.disconnect().await;

        let mut session = self.lock();
        if session.generation != generation
            || !matches!(session.connection, ConnectionState::Disconnecting)
        {
            return;
        }
        self.publish(&mut session, ConnectionState::Disconnected(Some(err)));
        self.schedule_reconnect(&mut session);
    }

    async fn shutdown(&self, reason: Option<McpError>) {
        enum Plan {
            Done,
            AwaitTeardown,
            Teardown(u64, Vec<PendingCall>),
        }

        let plan = {
            let mut session = self.lock();
            session.reconnect_paused = true;
            if let Some(task) = session.reconnect.take() {
                task.cancel();
            }
            match session.connection {
                ConnectionState::Disconnected(_) => {
                    if let Some(cycle) = session.cycle.take() {
                        cycle.cancel();
                    }
                    Plan::Done
                }
                ConnectionState::Reconnecting { .. } => {
                    session.reconnect_attempt = 0;
                    self.publish(&mut session, ConnectionState::Disconnected(reason.clone()));
                    Plan::Done
                }
                ConnectionState::Disconnecting => Plan::AwaitTeardown,
                ConnectionState::Connecting | ConnectionState::Connected => {
                    tracing::info!("Disconnecting MCP session '{}'", self.transport.name());
                    let calls = self.begin_teardown(&mut session);
                    Plan::Teardown(session.generation, calls)
                }
            }
        };

        match plan {
            Plan::Done => {}
            Plan::AwaitTeardown => {
                let mut rx = self.state_tx.subscribe();
                let _ = rx
                    .wait_for(|s| !matches!(s, ConnectionState::Disconnecting))
                    .await
                    .map(|_| ());
            }
            Plan::Teardown(generation, calls) => {
                for call in calls {
                    call.resolve(Err(McpError::Cancelled));
                }
                self.transport.disconnect().await;
                let mut session = self.lock();
                if session.generation == generation
                    && matches!(session.connection, ConnectionState::Disconnecting)
                {
                    self.publish(&mut session, ConnectionState::Disconnected(reason));
                }
            }
        }
    }

    // -- transport observation and handshake -------------------------------

    async fn observe_transport(
        self: Arc<Self>,
        generation: u64,
        cycle: CancellationToken,
        mut states: StateStream,
    ) {
        loop {
            let next = tokio::select! {
                _ = cycle.cancelled() => return,
                next = states.next() => next,
            };
            match next {
                Some(TransportState::Connecting) => {
                    tracing::debug!("Transport '{}' connecting", self.transport.name());
                }
                Some(TransportState::Connected) => self.begin_handshake(generation, &cycle),
                Some(TransportState::Disconnected(reason)) => {
                    let err = reason.unwrap_or(TransportError::Closed);
                    self.fail_connection(generation, McpError::Transport(err)).await;
                    return;
                }
                None => {
                    self.fail_connection(generation, McpError::Transport(TransportError::Closed))
                        .await;
                    return;
                }
            }
        }
    }

    fn begin_handshake(self: &Arc<Self>, generation: u64, cycle: &CancellationToken) {
        {
            let mut session = self.lock();
            if session.generation != generation
                || !matches!(session.connection, ConnectionState::Connecting)
                || session.handshaking
            {
                tracing::debug!("Ignoring transport connect; handshake not applicable");
                return;
            }
            session.handshaking = true;
        }

        let this = Arc::clone(self);
        let cycle = cycle.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cycle.cancelled() => return,
                outcome = this.handshake(generation) => outcome,
            };
            match outcome {
                Ok(result) => this.complete_handshake(generation, result, &cycle),
                Err(e) => {
                    this.fail_connection(generation, McpError::HandshakeFailed(Box::new(e)))
                        .await
                }
            }
        });
    }

    async fn handshake(&self, generation: u64) -> Result<InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: self.config.protocol_version.clone(),
            capabilities: self.config.capabilities.clone(),
            client_info: self.config.client_info.clone(),
        };
        let result = self
            .call(
                "initialize",
                encode_params(&params)?,
                Admission::Handshake(generation),
                std::any::type_name::<InitializeResult>(),
            )
            .await?;
        let result: InitializeResult =
            serde_json::from_value(result).map_err(McpError::decoding)?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(McpError::UnsupportedProtocolVersion(result.protocol_version));
        }

        let initialized = encode_notification("notifications/initialized", None)?;
        self.transport.send(initialized).await?;
        Ok(result)
    }

    fn complete_handshake(
        self: &Arc<Self>,
        generation: u64,
        result: InitializeResult,
        cycle: &CancellationToken,
    ) {
        let mut session = self.lock();
        if session.generation != generation
            || !matches!(session.connection, ConnectionState::Connecting)
        {
            return;
        }
        tracing::info!(
            "MCP server '{}' {} connected via {} (protocol {})",
            result.server_info.name,
            result.server_info.version,
            self.transport.name(),
            result.protocol_version
        );
        session.server = Some(result);
        session.handshaking = false;
        session.reconnect_attempt = 0;
        if let Some(task) = session.reconnect.take() {
            task.cancel();
        }
        self.publish(&mut session, ConnectionState::Connected);

        if let Some(interval) = self.config.heartbeat_interval {
            if self.transport.is_persistent() {
                tokio::spawn(Arc::clone(self).heartbeat(generation, cycle.clone(), interval));
            }
        }
    }

    // -- heartbeat and reconnection ----------------------------------------

    async fn heartbeat(self: Arc<Self>, generation: u64, cycle: CancellationToken, interval: Duration) {
        loop {
            tokio::select! {
                _ = cycle.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            {
                let session = self.lock();
                if session.generation != generation || !session.connection.is_connected() {
                    return;
                }
            }

            let ping = self.call("ping", None, Admission::Connected, "ping");
            let outcome = tokio::select! {
                _ = cycle.cancelled() => return,
                outcome = ping => outcome,
            };
            if let Err(e) = outcome {
                if cycle.is_cancelled() {
                    return;
                }
                self.fail_connection(generation, McpError::PingFailed(Box::new(e)))
                    .await;
                return;
            }
        }
    }

    /// Start the reconnection loop unless disabled, paused, or already running.
    fn schedule_reconnect(self: &Arc<Self>, session: &mut Session) {
        if !self.config.reconnect.enabled || session.reconnect_paused {
            return;
        }
        if session.reconnect.as_ref().is_some_and(ReconnectTask::is_running) {
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).reconnect_loop(token.clone()));
        session.reconnect = Some(ReconnectTask { token, handle });
    }

    async fn reconnect_loop(self: Arc<Self>, token: CancellationToken) {
        let policy = &self.config.reconnect;
        loop {
            // Let the previous attempt settle before scheduling the next one.
            match self.settled(&token).await {
                Some(true) | None => return,
                Some(false) => {}
            }

            let (attempt, delay) = {
                let mut session = self.lock();
                if token.is_cancelled() {
                    return;
                }
                if !session.connection.is_disconnected() {
                    continue;
                }
                session.reconnect_attempt += 1;
                let attempt = session.reconnect_attempt;
                if policy.exhausted(attempt) {
                    tracing::warn!(
                        "Giving up on MCP server via '{}' after {} reconnect attempts",
                        self.transport.name(),
                        policy.max_attempts
                    );
                    session.reconnect_paused = true;
                    self.publish(
                        &mut session,
                        ConnectionState::Disconnected(Some(McpError::MaxReconnectAttemptsReached(
                            policy.max_attempts,
                        ))),
                    );
                    return;
                }
                let delay = policy.delay_for_attempt(attempt);
                self.publish(&mut session, ConnectionState::Reconnecting { attempt, delay });
                (attempt, delay)
            };

            tracing::info!(
                "Reconnecting via '{}' in {}ms (attempt {attempt})",
                self.transport.name(),
                delay.as_millis()
            );
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.open(Some(&token)).await {
                Ok(()) => {}
                Err(McpError::Cancelled | McpError::AlreadyConnected) => return,
                Err(e) => tracing::debug!("Reconnect attempt {attempt} failed: {e}"),
            }
        }
    }

    /// Wait for `Connected` (true) or `Disconnected` (false). `None` if cancelled.
    async fn settled(&self, token: &CancellationToken) -> Option<bool> {
        let mut rx = self.state_tx.subscribe();
        let settled = async {
            rx.wait_for(|s| s.is_connected() || s.is_disconnected())
                .await
                .map(|s| s.is_connected())
                .ok()
        };
        tokio::select! {
            _ = token.cancelled() => None,
            settled = settled => settled,
        }
    }

    // -- requests ----------------------------------------------------------

    /// Register, send, and await one request. The pending entry is removed
    /// on every exit path: response, send failure, timeout, or the caller
    /// dropping the future.
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        admission: Admission,
        result_type: &'static str,
    ) -> CallOutcome {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let frame = serde_json::to_vec(&JsonRpcRequest::new(id.clone(), method, params))
            .map_err(McpError::encoding)?;

        let rx = {
            let mut session = self.lock();
            let admitted = match admission {
                Admission::Connected => session.connection.is_connected(),
                Admission::Handshake(generation) => {
                    session.generation == generation
                        && matches!(session.connection, ConnectionState::Connecting)
                }
            };
            if !admitted {
                return Err(McpError::NotConnected);
            }
            let (call, rx) = PendingCall::new(method, result_type);
            if session.pending.insert(id.clone(), call).is_err() {
                return Err(McpError::UnexpectedMessageFormat(format!(
                    "request id {id} is already in flight"
                )));
            }
            rx
        };
        let mut guard = PendingGuard {
            inner: self,
            id: Some(id),
        };

        tracing::debug!("-> {method} (expects {result_type})");
        if let Err(e) = self.transport.send(Bytes::from(frame)).await {
            guard.retire();
            return Err(McpError::Transport(e));
        }

        let received = match self.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    if let Some(id) = guard.retire() {
                        self.cancel_remote(id, "timeout").await;
                    }
                    return Err(McpError::Timeout {
                        method: method.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };
        guard.disarm();
        received.unwrap_or(Err(McpError::Cancelled))
    }

    /// Best-effort `notifications/cancelled` for a request we stopped waiting on.
    async fn cancel_remote(&self, id: RequestId, reason: &str) {
        let params = CancelledParams {
            request_id: id,
            reason: Some(reason.to_string()),
        };
        let frame = encode_params(&params)
            .and_then(|params| encode_notification("notifications/cancelled", params));
        match frame {
            Ok(frame) => {
                if let Err(e) = self.transport.send(frame).await {
                    tracing::debug!("Failed to send cancellation: {e}");
                }
            }
            Err(e) => tracing::debug!("Failed to encode cancellation: {e}"),
        }
    }

    // -- inbound -----------------------------------------------------------

    async fn read_inbound(self: Arc<Self>, cycle: CancellationToken, mut incoming: MessageStream) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cycle.cancelled() => return,
                frame = incoming.next() => frame,
            };
            let Some(frame) = frame else {
                tracing::debug!("Inbound stream from '{}' ended", self.transport.name());
                return;
            };
            self.dispatch(&cycle, &frame).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, cycle: &CancellationToken, frame: &[u8]) {
        let message = match JsonRpcMessage::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping unparseable message: {e}");
                return;
            }
        };
        match message {
            JsonRpcMessage::Response { id, payload } => self.resolve_response(id, payload),
            JsonRpcMessage::Notification { method, params } => {
                self.route_notification(&method, params)
            }
            JsonRpcMessage::Request { id, method, params } => {
                self.serve_request(cycle, id, &method, params).await
            }
            JsonRpcMessage::Malformed { reason } => {
                tracing::warn!("Dropping message: {}", McpError::UnexpectedMessageFormat(reason));
            }
        }
    }

    fn resolve_response(&self, id: RequestId, payload: ResponsePayload) {
        let call = self.lock().pending.remove(&id);
        let Some(call) = call else {
            tracing::warn!("Dropping message: {}", McpError::UnsolicitedResponse(id));
            return;
        };
        let outcome = match payload.into_outcome() {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(McpError::JsonRpc(error)),
            Err(e) => {
                tracing::warn!("Malformed error object in response {id} to '{}'", call.method);
                Err(McpError::decoding(e))
            }
        };
        tracing::debug!("<- response {id} for '{}'", call.method);
        call.resolve(outcome);
    }

    fn route_notification(&self, method: &str, params: Option<Value>) {
        let handler = &self.notifications;
        let routed = match method {
            "notifications/message" => decode(params).map(|p| handler.on_log_message(p)),
            "notifications/resources/updated" => {
                decode(params).map(|p| handler.on_resource_updated(p))
            }
            "notifications/resources/list_changed" => {
                handler.on_resources_list_changed();
                Ok(())
            }
            "notifications/tools/list_changed" => {
                handler.on_tools_list_changed();
                Ok(())
            }
            "notifications/prompts/list_changed" => {
                handler.on_prompts_list_changed();
                Ok(())
            }
            "notifications/progress" => decode(params).map(|p| handler.on_progress(p)),
            "notifications/cancelled" => decode(params).map(|p| handler.on_cancelled(p)),
            other => {
                tracing::debug!("Ignoring unknown notification '{other}'");
                Ok(())
            }
        };
        if let Err(e) = routed {
            tracing::warn!("Dropping malformed '{method}' notification: {e}");
        }
    }

    /// Decode params in order, then run the handler on its own task so a
    /// slow handler never stalls the inbound loop.
    async fn serve_request(
        self: &Arc<Self>,
        cycle: &CancellationToken,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) {
        match self.requests.prepare(method, params) {
            Ok(handler) => {
                let this = Arc::clone(self);
                let cycle = cycle.clone();
                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        _ = cycle.cancelled() => return,
                        outcome = handler => outcome,
                    };
                    this.reply(id, outcome).await;
                });
            }
            Err(error) => {
                tracing::warn!("Rejecting server request '{method}': {}", error.message);
                self.reply(id, Err(error)).await;
            }
        }
    }

    async fn reply(&self, id: RequestId, outcome: Result<Value, ErrorObject>) {
        let frame = match outcome {
            Ok(result) => serde_json::to_vec(&JsonRpcResponse::new(id, result)),
            Err(error) => serde_json::to_vec(&JsonRpcErrorResponse::new(Some(id), error)),
        };
        match frame {
            Ok(frame) => {
                if let Err(e) = self.transport.send(Bytes::from(frame)).await {
                    tracing::warn!("Failed to reply to server request: {e}");
                }
            }
            Err(e) => tracing::warn!("Failed to encode reply: {e}"),
        }
    }
}

/// Removes a pending entry unless disarmed; covers callers that drop the
/// request future mid-flight.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: Option<RequestId>,
}

impl PendingGuard<'_> {
    fn retire(&mut self) -> Option<RequestId> {
        let id = self.id.take()?;
        self.inner.lock().pending.remove(&id);
        Some(id)
    }

    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.retire();
    }
}

fn encode_params(params: impl Serialize) -> Result<Option<Value>, McpError> {
    match serde_json::to_value(params).map_err(McpError::encoding)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

fn encode_notification(method: &str, params: Option<Value>) -> Result<Bytes, McpError> {
    serde_json::to_vec(&JsonRpcNotification::new(method, params))
        .map(Bytes::from)
        .map_err(McpError::encoding)
}

fn decode<T: DeserializeOwned>(params: Option<Value>) -> Result<T, serde_json::Error> {
    serde_json::from_value(params.unwrap_or(Value::Null))
}
