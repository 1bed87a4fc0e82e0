//! Integration tests for the HTTP+SSE and streamable HTTP transports.
//!
//! Uses a raw TCP test server that records every request and answers
//! from a per-test handler.

use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_transport::{HttpConfig, SseTransport, StreamableHttpTransport};
use tether_types::{Transport, TransportError, TransportState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Test server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
}

enum Reply {
    /// A complete raw HTTP response.
    Full(String),
    /// A `text/event-stream` response fed chunk by chunk; the body ends
    /// when the sender is dropped.
    Stream(mpsc::UnboundedReceiver<String>),
}

type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;
type RequestLog = Arc<Mutex<Vec<Request>>>;

/// Start a test server. Returns its base URL and the request log.
async fn start_test_server(handler: Handler) -> (String, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let log_clone = Arc::clone(&log);

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let handler = Arc::clone(&handler);
            let log = Arc::clone(&log_clone);
            tokio::spawn(async move {
                handle_connection(socket, handler, log).await;
            });
        }
    });

    (format!("http://{addr}"), log)
}

async fn handle_connection(mut socket: TcpStream, handler: Handler, log: RequestLog) {
    let Some(request) = read_request(&mut socket).await else {
        return;
    };
    log.lock().unwrap().push(request.clone());

    match handler(&request) {
        Reply::Full(raw) => {
            let _ = socket.write_all(raw.as_bytes()).await;
        }
        Reply::Stream(mut chunks) => {
            let head = "HTTP/1.1 200 OK\r\n\
                        Content-Type: text/event-stream\r\n\
                        Cache-Control: no-cache\r\n\
                        Connection: close\r\n\
                        \r\n";
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.flush().await;
            while let Some(chunk) = chunks.recv().await {
                if socket.write_all(chunk.as_bytes()).await.is_err() {
                    break;
                }
                let _ = socket.flush().await;
            }
        }
    }
    let _ = socket.flush().await;
    let _ = socket.shutdown().await;
}

async fn read_request(socket: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[head_end..]).into_owned();

    Some(Request {
        method,
        path,
        headers,
        body,
    })
}

fn response(status: &str, content_type: &str, extra_headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         {extra_headers}\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

fn accepted() -> Reply {
    Reply::Full(response("202 Accepted", "text/plain", "", ""))
}

fn requests(log: &RequestLog, method: &str) -> Vec<Request> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|r| r.method == method)
        .cloned()
        .collect()
}

fn fast_retries(url: &str, retries: u32) -> HttpConfig {
    HttpConfig {
        connect_retries: retries,
        retry_delay_ms: 10,
        ..HttpConfig::new(url)
    }
}

async fn next<T>(stream: &mut std::pin::Pin<Box<dyn futures_core::Stream<Item = T> + Send>>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("timed out waiting for stream item")
}

// ---------------------------------------------------------------------------
// HTTP+SSE
// ---------------------------------------------------------------------------

/// Server whose event stream is driven by the returned sender.
async fn sse_server() -> (String, RequestLog, mpsc::UnboundedSender<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let rx = Mutex::new(Some(rx));
    let handler: Handler = Arc::new(move |req| match req.method.as_str() {
        "GET" => match rx.lock().unwrap().take() {
            Some(rx) => Reply::Stream(rx),
            None => Reply::Full(response("409 Conflict", "text/plain", "", "busy")),
        },
        _ => accepted(),
    });
    let (base, log) = start_test_server(handler).await;
    (format!("{base}/sse"), log, tx)
}

#[tokio::test]
async fn sse_connects_after_endpoint_event() {
    let (url, log, events) = sse_server().await;
    let transport = SseTransport::new(HttpConfig::new(&url)).unwrap();
    let mut states = transport.state_changes();
    let mut incoming = transport.incoming();

    events
        .send(": hello\n\nevent: endpoint\ndata: /messages?sessionId=abc\n\n".into())
        .unwrap();
    transport.connect().await.unwrap();

    assert!(matches!(next(&mut states).await, Some(TransportState::Connecting)));
    assert!(matches!(next(&mut states).await, Some(TransportState::Connected)));
    let endpoint = transport.endpoint().unwrap();
    assert_eq!(endpoint.path(), "/messages");
    assert_eq!(endpoint.query(), Some("sessionId=abc"));

    let get = requests(&log, "GET").remove(0);
    assert_eq!(get.path, "/sse");
    assert_eq!(get.headers["accept"], "text/event-stream");

    // Outbound messages are POSTed to the announced endpoint.
    transport
        .send(Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .await
        .unwrap();
    let post = requests(&log, "POST").remove(0);
    assert_eq!(post.path, "/messages?sessionId=abc");
    assert_eq!(post.headers["content-type"], "application/json");
    assert_eq!(post.body, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);

    // Server messages arrive as `message` events.
    events
        .send("event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n".into())
        .unwrap();
    let frame = next(&mut incoming).await.unwrap();
    assert_eq!(&frame[..], br#"{"jsonrpc":"2.0","id":1,"result":{}}"#);

    transport.disconnect().await;
    assert!(matches!(
        next(&mut states).await,
        Some(TransportState::Disconnected(None))
    ));
    assert!(next(&mut incoming).await.is_none());
}

#[tokio::test]
async fn sse_stream_end_is_reported() {
    let (url, _log, events) = sse_server().await;
    let transport = SseTransport::new(HttpConfig::new(&url)).unwrap();
    let mut states = transport.state_changes();

    events.send("event: endpoint\ndata: /messages\n\n".into()).unwrap();
    transport.connect().await.unwrap();
    assert!(matches!(next(&mut states).await, Some(TransportState::Connecting)));
    assert!(matches!(next(&mut states).await, Some(TransportState::Connected)));

    drop(events);
    assert!(matches!(
        next(&mut states).await,
        Some(TransportState::Disconnected(Some(_)))
    ));
    assert!(transport.endpoint().is_none());
    assert!(matches!(
        transport.send(Bytes::from_static(b"{}")).await,
        Err(TransportError::NotConnected)
    ));
}

#[tokio::test]
async fn sse_stream_closed_before_endpoint_fails_connect() {
    let (url, _log, events) = sse_server().await;
    let transport = SseTransport::new(HttpConfig::new(&url)).unwrap();
    events.send("event: message\ndata: {}\n\n".into()).unwrap();
    drop(events);

    assert!(matches!(
        transport.connect().await,
        Err(TransportError::Closed)
    ));
    assert!(transport.endpoint().is_none());
}

#[tokio::test]
async fn sse_client_errors_are_not_retried() {
    let handler: Handler = Arc::new(|_| {
        Reply::Full(response("401 Unauthorized", "text/plain", "", "bad token"))
    });
    let (base, log) = start_test_server(handler).await;
    let transport = SseTransport::new(fast_retries(&base, 3)).unwrap();

    match transport.connect().await {
        Err(TransportError::Status { status, body }) => {
            assert_eq!(status, 401);
            assert_eq!(body, "bad token");
        }
        other => panic!("Expected 401, got: {other:?}"),
    }
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sse_server_errors_are_retried() {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    tx.send("event: endpoint\ndata: http://other.example/post\n\n".into())
        .unwrap();
    let attempts = Mutex::new(0);
    let rx = Mutex::new(Some(rx));
    let handler: Handler = Arc::new(move |_| {
        let mut attempts = attempts.lock().unwrap();
        *attempts += 1;
        if *attempts < 3 {
            return Reply::Full(response("503 Service Unavailable", "text/plain", "", ""));
        }
        Reply::Stream(rx.lock().unwrap().take().unwrap())
    });
    let (base, log) = start_test_server(handler).await;
    let transport = SseTransport::new(fast_retries(&base, 3)).unwrap();

    transport.connect().await.unwrap();
    assert_eq!(log.lock().unwrap().len(), 3);
    // Absolute endpoints are taken as-is.
    assert_eq!(
        transport.endpoint().unwrap().as_str(),
        "http://other.example/post"
    );
    transport.disconnect().await;
    drop(tx);
}

#[tokio::test]
async fn sse_gives_up_after_connect_retries() {
    let handler: Handler =
        Arc::new(|_| Reply::Full(response("500 Internal Server Error", "text/plain", "", "")));
    let (base, log) = start_test_server(handler).await;
    let transport = SseTransport::new(fast_retries(&base, 2)).unwrap();
    let mut states = transport.state_changes();

    assert!(matches!(
        transport.connect().await,
        Err(TransportError::Status { status: 500, .. })
    ));
    assert_eq!(log.lock().unwrap().len(), 3);
    assert!(matches!(next(&mut states).await, Some(TransportState::Connecting)));
    assert!(matches!(
        next(&mut states).await,
        Some(TransportState::Disconnected(Some(_)))
    ));
}

// ---------------------------------------------------------------------------
// Streamable HTTP
// ---------------------------------------------------------------------------

const INIT_REPLY: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26"}}"#;

fn streamable_handler() -> Handler {
    Arc::new(|req| match (req.method.as_str(), req.body.as_str()) {
        ("DELETE", _) => Reply::Full(response("200 OK", "text/plain", "", "")),
        (_, body) if body.contains("\"initialize\"") => Reply::Full(response(
            "200 OK",
            "application/json",
            "Mcp-Session-Id: s-1\r\n",
            INIT_REPLY,
        )),
        (_, body) if body.contains("\"tools/list\"") => Reply::Full(response(
            "200 OK",
            "text/event-stream",
            "",
            "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
             data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[]}}\n\n",
        )),
        (_, body) if body.contains("\"batch\"") => Reply::Full(response(
            "200 OK",
            "application/json",
            "",
            r#"[{"jsonrpc":"2.0","id":3,"result":{}},{"jsonrpc":"2.0","id":4,"result":{}}]"#,
        )),
        (_, body) if body.contains("\"ndjson\"") => Reply::Full(response(
            "200 OK",
            "application/x-ndjson",
            "",
            "{\"jsonrpc\":\"2.0\",\"id\":5,\"result\":{}}\n\n{\"jsonrpc\":\"2.0\",\"id\":6,\"result\":{}}\n",
        )),
        (_, body) if body.contains("\"bad\"") => Reply::Full(response(
            "400 Bad Request",
            "text/plain",
            "",
            "nope",
        )),
        _ => accepted(),
    })
}

async fn connected_streamable() -> (StreamableHttpTransport, RequestLog) {
    let (base, log) = start_test_server(streamable_handler()).await;
    let transport = StreamableHttpTransport::new(fast_retries(&format!("{base}/mcp"), 0)).unwrap();
    transport.connect().await.unwrap();
    (transport, log)
}

fn frame_id(frame: &Bytes) -> serde_json::Value {
    serde_json::from_slice::<serde_json::Value>(frame).unwrap()["id"].clone()
}

#[tokio::test]
async fn streamable_json_reply_and_session_id() {
    let (base, log) = start_test_server(streamable_handler()).await;
    let transport = StreamableHttpTransport::new(HttpConfig::new(format!("{base}/mcp"))).unwrap();
    assert!(!transport.is_persistent());
    let mut states = transport.state_changes();
    let mut incoming = transport.incoming();

    transport.connect().await.unwrap();
    assert!(matches!(next(&mut states).await, Some(TransportState::Connecting)));
    assert!(matches!(next(&mut states).await, Some(TransportState::Connected)));

    transport
        .send(Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#))
        .await
        .unwrap();
    let frame = next(&mut incoming).await.unwrap();
    assert_eq!(&frame[..], INIT_REPLY.as_bytes());
    assert_eq!(transport.session_id().as_deref(), Some("s-1"));

    let first = requests(&log, "POST").remove(0);
    assert_eq!(first.path, "/mcp");
    assert_eq!(first.headers["accept"], "application/json, text/event-stream");
    assert!(!first.headers.contains_key("mcp-session-id"));

    transport
        .send(Bytes::from_static(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#))
        .await
        .unwrap();
    let second = requests(&log, "POST").remove(1);
    assert_eq!(second.headers["mcp-session-id"], "s-1");

    transport.disconnect().await;
    let delete = requests(&log, "DELETE").remove(0);
    assert_eq!(delete.headers["mcp-session-id"], "s-1");
    assert!(transport.session_id().is_none());
    assert!(matches!(
        next(&mut states).await,
        Some(TransportState::Disconnected(None))
    ));
}

#[tokio::test]
async fn streamable_sse_reply_is_emitted_in_order() {
    let (transport, _log) = connected_streamable().await;
    let mut incoming = transport.incoming();

    transport
        .send(Bytes::from_static(br#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#))
        .await
        .unwrap();
    let progress = next(&mut incoming).await.unwrap();
    assert_eq!(frame_id(&progress), serde_json::Value::Null);
    let result = next(&mut incoming).await.unwrap();
    assert_eq!(frame_id(&result), 2);
    transport.disconnect().await;
}

#[tokio::test]
async fn streamable_batch_and_ndjson_replies_are_split() {
    let (transport, _log) = connected_streamable().await;
    let mut incoming = transport.incoming();

    transport
        .send(Bytes::from_static(br#"{"jsonrpc":"2.0","id":3,"method":"batch"}"#))
        .await
        .unwrap();
    assert_eq!(frame_id(&next(&mut incoming).await.unwrap()), 3);
    assert_eq!(frame_id(&next(&mut incoming).await.unwrap()), 4);

    transport
        .send(Bytes::from_static(br#"{"jsonrpc":"2.0","id":5,"method":"ndjson"}"#))
        .await
        .unwrap();
    assert_eq!(frame_id(&next(&mut incoming).await.unwrap()), 5);
    assert_eq!(frame_id(&next(&mut incoming).await.unwrap()), 6);
    transport.disconnect().await;
}

#[tokio::test]
async fn streamable_error_status_fails_send() {
    let (transport, _log) = connected_streamable().await;
    match transport
        .send(Bytes::from_static(br#"{"jsonrpc":"2.0","id":9,"method":"bad"}"#))
        .await
    {
        Err(TransportError::Status { status, body }) => {
            assert_eq!(status, 400);
            assert_eq!(body, "nope");
        }
        other => panic!("Expected 400, got: {other:?}"),
    }
    transport.disconnect().await;
}

#[tokio::test]
async fn streamable_requires_connect() {
    let (base, log) = start_test_server(streamable_handler()).await;
    let transport = StreamableHttpTransport::new(HttpConfig::new(base)).unwrap();
    assert!(matches!(
        transport.send(Bytes::from_static(b"{}")).await,
        Err(TransportError::NotConnected)
    ));
    transport.connect().await.unwrap();
    assert!(matches!(
        transport.connect().await,
        Err(TransportError::AlreadyConnected)
    ));
    // No session was assigned, so disconnect sends nothing.
    transport.disconnect().await;
    assert!(log.lock().unwrap().is_empty());
}
