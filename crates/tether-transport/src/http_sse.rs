//! HTTP+SSE transport (the 2024-11-05 MCP HTTP binding).
//!
//! The client holds a `GET` event stream open. The server's first
//! `endpoint` event names the URL that client messages are POSTed to;
//! server messages arrive as `message` events on the stream.

use crate::http::{self, HttpConfig};
use crate::stream::SseStream;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Url;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_types::{
    BoxFuture, MessageStream, Outlet, StateStream, Transport, TransportError, TransportState,
};
use tokio::task::JoinHandle;

/// How long to wait for the `endpoint` event after the stream opens.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Persistent transport over a server-sent event stream.
pub struct SseTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: HttpConfig,
    url: Url,
    http: reqwest::Client,
    messages: Outlet<Bytes>,
    states: Outlet<TransportState>,
    link: Mutex<Option<Link>>,
    last_event_id: Mutex<Option<String>>,
    next_generation: AtomicU64,
}

/// One open event stream.
struct Link {
    generation: u64,
    endpoint: Url,
    reader: JoinHandle<()>,
}

impl SseTransport {
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
                link: Mutex::new(None),
                last_event_id: Mutex::new(None),
                next_generation: AtomicU64::new(1),
            }),
        })
    }

    /// The POST endpoint announced by the server, while connected.
    pub fn endpoint(&self) -> Option<Url> {
        self.shared.lock().as_ref().map(|link| link.endpoint.clone())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_event_id(&self) -> MutexGuard<'_, Option<String>> {
        self.last_event_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the event stream, retrying transient failures with backoff.
    async fn open_stream(&self) -> Result<SseStream, TransportError> {
        let mut retry = 0;
        loop {
            match self.try_open_stream().await {
                Ok(stream) => return Ok(stream),
                Err(e) if retry < self.config.connect_retries && http::is_retryable(&e) => {
                    let delay = self.config.retry_delay(retry);
                    retry += 1;
                    tracing::warn!(
                        "SSE connect failed (attempt {retry}/{}): {e}. Retrying in {}ms...",
                        self.config.connect_retries + 1,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_open_stream(&self) -> Result<SseStream, TransportError> {
        tracing::debug!("GET {}", self.url);
        let mut request = self
            .http
            .get(self.url.clone())
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let resume_from = self.last_event_id().clone();
        if let Some(id) = resume_from {
            request = request.header("Last-Event-ID", id);
        }

        let response = request.send().await.map_err(http::network_error)?;
        if !response.status().is_success() {
            return Err(http::status_error(response).await);
        }
        Ok(SseStream::from_response(response))
    }

    /// Read events until the server announces where to POST.
    async fn await_endpoint(&self, stream: &mut SseStream) -> Result<Url, TransportError> {
        while let Some(event) = stream.next().await {
            let event = event?;
            self.note_event_id(event.id.as_deref());
            match event.kind() {
                "endpoint" => return self.resolve_endpoint(&event.data),
                other => tracing::debug!("Ignoring '{other}' event before endpoint"),
            }
        }
        Err(TransportError::Closed)
    }

    fn resolve_endpoint(&self, data: &str) -> Result<Url, TransportError> {
        self.url
            .join(data.trim())
            .map_err(|e| TransportError::Other(format!("invalid endpoint '{data}': {e}")))
    }

    fn note_event_id(&self, id: Option<&str>) {
        if let Some(id) = id {
            *self.last_event_id() = Some(id.to_string());
        }
    }

    /// Pump `message` events until the stream ends.
    async fn read_events(self: Arc<Self>, generation: u64, mut stream: SseStream) {
        let error = loop {
            match stream.next().await {
                Some(Ok(event)) => {
                    self.note_event_id(event.id.as_deref());
                    match event.kind() {
                        "message" => {
                            if event.data.is_empty() {
                                continue;
                            }
                            tracing::debug!("sse <- {}", event.data);
                            self.messages.emit(Bytes::from(event.data));
                        }
                        "endpoint" => match self.resolve_endpoint(&event.data) {
                            Ok(endpoint) => {
                                if let Some(link) = self.lock().as_mut() {
                                    if link.generation == generation {
                                        link.endpoint = endpoint;
                                    }
                                }
                            }
                            Err(e) => tracing::warn!("{e}"),
                        },
                        other => tracing::debug!("Ignoring SSE event '{other}'"),
                    }
                }
                Some(Err(e)) => break e,
                None => break TransportError::Closed,
            }
        };

        let link = self.lock().take_if(|link| link.generation == generation);
        if link.is_some() {
            tracing::info!("SSE stream from {} ended: {error}", self.url);
            self.states
                .emit(TransportState::Disconnected(Some(error)));
            self.messages.close();
            self.states.close();
        }
    }
}

impl Transport for SseTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let shared = &self.shared;
            if shared.lock().is_some() {
                return Err(TransportError::AlreadyConnected);
            }
            shared.states.emit(TransportState::Connecting);

            let opened = async {
                let mut stream = shared.open_stream().await?;
                let endpoint = tokio::time::timeout(ENDPOINT_TIMEOUT, shared.await_endpoint(&mut stream))
                    .await
                    .map_err(|_| TransportError::Other("timed out waiting for endpoint event".into()))??;
                Ok::<_, TransportError>((stream, endpoint))
            };

            let (stream, endpoint) = match opened.await {
                Ok(opened) => opened,
                Err(e) => {
                    shared
                        .states
                        .emit(TransportState::Disconnected(Some(e.clone())));
                    return Err(e);
                }
            };

            tracing::info!("SSE connected to {}; posting to {endpoint}", shared.url);
            let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed);
            let mut slot = shared.lock();
            if slot.is_some() {
                return Err(TransportError::AlreadyConnected);
            }
            let reader = tokio::spawn(Arc::clone(shared).read_events(generation, stream));
            *slot = Some(Link {
                generation,
                endpoint,
                reader,
            });
            shared.states.emit(TransportState::Connected);
            Ok(())
        })
    }

    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let endpoint = self.endpoint().ok_or(TransportError::NotConnected)?;
            tracing::debug!("POST {endpoint}: {}", String::from_utf8_lossy(&message));

            let response = self
                .shared
                .http
                .post(endpoint)
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(message)
                .send()
                .await
                .map_err(http::network_error)?;
            if !response.status().is_success() {
                return Err(http::status_error(response).await);
            }
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
            let link = self.shared.lock().take();
            if let Some(link) = link {
                link.reader.abort();
                tracing::info!("SSE stream to {} closed", self.shared.url);
            }
            self.shared.states.emit(TransportState::Disconnected(None));
            self.shared.messages.close();
            self.shared.states.close();
        })
    }

    fn name(&self) -> &str {
        "sse"
    }
}
