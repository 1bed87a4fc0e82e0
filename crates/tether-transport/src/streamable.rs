//! Streamable HTTP transport (the 2025-03-26 MCP HTTP binding).
//!
//! Every client message is POSTed to one endpoint. The reply body carries
//! any server messages: a JSON object, a JSON batch array, an SSE stream,
//! or newline-delimited JSON. The server may assign a session id which is
//! echoed on every later request and released with `DELETE` on disconnect.

use crate::http::{self, HttpConfig};
use crate::stream::SseStream;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use reqwest::{StatusCode, Url};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_types::{
    BoxFuture, MessageStream, Outlet, StateStream, Transport, TransportError, TransportState,
};
use tokio_util::sync::CancellationToken;

/// Response header carrying the server-assigned session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Non-persistent transport: one HTTP exchange per outbound message.
pub struct StreamableHttpTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: HttpConfig,
    url: Url,
    http: reqwest::Client,
    messages: Outlet<Bytes>,
    states: Outlet<TransportState>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    /// Set while connected; cancels in-flight response streams.
    open: Option<CancellationToken>,
    id: Option<String>,
}

impl StreamableHttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self, TransportError> {
        let url = config.parse_url()?;
        let http = config.client()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                url,
                http,
                messages: Outlet::new(),
                states: Outlet::new(),
                session: Mutex::new(Session::default()),
            }),
        })
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().id.clone()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// POST one message, retrying transient failures with backoff.
    async fn post(&self, message: &Bytes) -> Result<reqwest::Response, TransportError> {
        let mut retry = 0;
        loop {
            match self.try_post(message).await {
                Ok(response) => return Ok(response),
                Err(e) if retry < self.config.connect_retries && http::is_retryable(&e) => {
                    let delay = self.config.retry_delay(retry);
                    retry += 1;
                    tracing::warn!(
                        "POST {} failed (attempt {retry}/{}): {e}. Retrying in {}ms...",
                        self.url,
                        self.config.connect_retries + 1,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_post(&self, message: &Bytes) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .http
            .post(self.url.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(
                ACCEPT,
                HeaderValue::from_static("application/json, text/event-stream"),
            )
            .body(message.clone());
        let session_id = self.lock().id.clone();
        if let Some(id) = session_id {
            request = request.header(SESSION_ID_HEADER, id);
        }

        let response = request.send().await.map_err(http::network_error)?;
        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut session = self.lock();
            if session.id.as_deref() != Some(id) {
                tracing::debug!("MCP session id: {id}");
                session.id = Some(id.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && self.lock().id.take().is_some() {
            tracing::warn!("MCP session at {} expired", self.url);
        }
        if !status.is_success() {
            return Err(http::status_error(response).await);
        }
        Ok(response)
    }

    /// Emit every server message carried by a POST reply.
    async fn drain_body(&self, response: reqwest::Response) -> Result<(), TransportError> {
        if matches!(
            response.status(),
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT
        ) {
            return Ok(());
        }

        match http::content_type(&response).as_str() {
            "text/event-stream" => {
                let mut events = SseStream::from_response(response);
                while let Some(event) = events.next().await {
                    let event = event?;
                    if event.kind() == "message" && !event.data.is_empty() {
                        self.emit(Bytes::from(event.data));
                    }
                }
            }
            "application/json" => {
                let body = response.bytes().await.map_err(http::network_error)?;
                for frame in split_json_body(body) {
                    self.emit(frame);
                }
            }
            _ => {
                let body = response.bytes().await.map_err(http::network_error)?;
                for line in body.split(|b| *b == b'\n') {
                    let line = line.trim_ascii();
                    if !line.is_empty() {
                        self.emit(Bytes::copy_from_slice(line));
                    }
                }
            }
        }
        Ok(())
    }

    fn emit(&self, frame: Bytes) {
        tracing::debug!("http <- {}", String::from_utf8_lossy(&frame));
        self.messages.emit(frame);
    }

    /// Release the server session, if one was assigned.
    async fn release_session(&self, id: String) {
        let result = self
            .http
            .delete(self.url.clone())
            .header(SESSION_ID_HEADER, id)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            // 405 means the server does not let clients end sessions.
            Ok(response) => tracing::debug!(
                "Session DELETE to {} returned {}",
                self.url,
                response.status()
            ),
            Err(e) => tracing::debug!("Session DELETE to {} failed: {e}", self.url),
        }
    }
}

/// Split a JSON reply into frames: a batch array yields one frame per
/// element, anything else is passed through whole.
fn split_json_body(body: Bytes) -> Vec<Bytes> {
    if body.trim_ascii().is_empty() {
        return Vec::new();
    }
    match serde_json::from_slice::<Vec<serde_json::Value>>(&body) {
        Ok(batch) => batch
            .iter()
            .filter_map(|item| serde_json::to_vec(item).ok())
            .map(Bytes::from)
            .collect(),
        Err(_) => vec![body],
    }
}

impl Transport for StreamableHttpTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let mut session = self.shared.lock();
            if session.open.is_some() {
                return Err(TransportError::AlreadyConnected);
            }
            self.shared.states.emit(TransportState::Connecting);
            session.open = Some(CancellationToken::new());
            self.shared.states.emit(TransportState::Connected);
            Ok(())
        })
    }

    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let cancel = self
                .shared
                .lock()
                .open
                .clone()
                .ok_or(TransportError::NotConnected)?;
            tracing::debug!("POST {}: {}", self.shared.url, String::from_utf8_lossy(&message));

            let response = self.shared.post(&message).await?;
            // The reply may stream for a while (progress, then the result),
            // so drain it in the background and let the caller continue.
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = shared.drain_body(response) => {
                        if let Err(e) = result {
                            tracing::warn!("Failed to read response from {}: {e}", shared.url);
                        }
                    }
                }
            });
            Ok(())
        })
    }

    fn incoming(&self) -> MessageStream {
        self.shared.messages.subscribe()
    }

    fn state_changes(&self) -> StateStream {
        self.shared.states.subscribe()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let (open, id) = {
                let mut session = self.shared.lock();
                (session.open.take(), session.id.take())
            };
            if let Some(cancel) = open {
                cancel.cancel();
            }
            if let Some(id) = id {
                self.shared.release_session(id).await;
            }
            self.shared.states.emit(TransportState::Disconnected(None));
            self.shared.messages.close();
            self.shared.states.close();
        })
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "streamable-http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_batch_is_split() {
        let frames = split_json_body(Bytes::from_static(
            br#"[{"jsonrpc":"2.0","id":1,"result":{}},{"jsonrpc":"2.0","method":"x"}]"#,
        ));
        assert_eq!(frames.len(), 2);
        let first: serde_json::Value = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(first["id"], 1);
    }

    #[test]
    fn single_object_passes_through() {
        let body = Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
        assert_eq!(split_json_body(body.clone()), vec![body]);
    }

    #[test]
    fn empty_body_has_no_frames() {
        assert!(split_json_body(Bytes::from_static(b"  \n")).is_empty());
    }
}
