//! Stdio transport for MCP server communication.
//!
//! Spawns a child process on `connect` and exchanges newline-delimited
//! JSON-RPC messages over its stdin/stdout. Stderr is forwarded to the log.

use crate::config::StdioConfig;
use bytes::Bytes;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_types::{
    BoxFuture, MessageStream, Outlet, StateStream, Transport, TransportError, TransportState,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long a child gets to exit after its stdin closes before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Outbound frames buffered ahead of the writer task.
const WRITE_QUEUE: usize = 64;

/// Async stdio transport for communicating with an MCP server process.
pub struct StdioTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: StdioConfig,
    messages: Outlet<Bytes>,
    states: Outlet<TransportState>,
    process: Mutex<Option<Process>>,
    next_generation: AtomicU64,
}

/// One running child and the tasks pumping its pipes.
struct Process {
    generation: u64,
    child: Child,
    write_tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                messages: Outlet::new(),
                states: Outlet::new(),
                process: Mutex::new(None),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// The process id of the running server, if any.
    pub fn pid(&self) -> Option<u32> {
        self.shared
            .lock()
            .as_ref()
            .and_then(|process| process.child.id())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<Process>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the child and start background reader/writer tasks.
    fn spawn(self: &Arc<Self>) -> Result<Process, TransportError> {
        let config = &self.config;
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| TransportError::Spawn {
            command: config.command.clone(),
            source: Arc::new(e),
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Other("child pipes unavailable".into()));
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // Writer task: drains channel and writes to child stdin
        let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = write_rx.recv().await {
                if let Err(e) = write_frame(&mut stdin, &msg).await {
                    tracing::debug!("stdio writer stopped: {e}");
                    break;
                }
            }
        });

        // Reader task: one frame per non-empty stdout line, kept as raw
        // bytes. Undecodable lines are the session's to drop.
        let shared = Arc::clone(self);
        let reader = tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match stdout.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = buf.trim_ascii();
                        if line.is_empty() {
                            continue;
                        }
                        tracing::debug!("stdio <- {}", String::from_utf8_lossy(line));
                        shared.messages.emit(Bytes::copy_from_slice(line));
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read from MCP server stdout: {e}");
                        break;
                    }
                }
            }
            shared.on_exit(generation).await;
        });

        let command = config.command.clone();
        let stderr = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut stderr = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Ok(n) = stderr.read_until(b'\n', &mut buf).await {
                    if n == 0 {
                        break;
                    }
                    tracing::debug!("{command} stderr: {}", String::from_utf8_lossy(buf.trim_ascii_end()));
                    buf.clear();
                }
            })
        });

        Ok(Process {
            generation,
            child,
            write_tx,
            reader,
            writer,
            stderr,
        })
    }

    /// Called by the reader when stdout closes. Whoever takes the process
    /// out of the slot owns its cleanup, so a requested disconnect that got
    /// there first turns this into a no-op.
    async fn on_exit(&self, generation: u64) {
        let process = self.lock().take_if(|p| p.generation == generation);
        let Some(mut process) = process else {
            return;
        };

        let code = reap(&mut process.child).await;
        process.writer.abort();
        if let Some(stderr) = process.stderr.take() {
            stderr.abort();
        }
        tracing::info!("MCP server '{}' exited (code: {code:?})", self.config.command);

        self.states
            .emit(TransportState::Disconnected(Some(TransportError::ProcessExited { code })));
        self.messages.close();
        self.states.close();
    }
}

impl Process {
    /// Close stdin, give the child a grace period, then kill it.
    async fn shutdown(mut self) {
        drop(self.write_tx);
        // The writer owns stdin; once its queue drains it drops the pipe.
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, &mut self.writer).await;
        self.writer.abort();
        let _ = reap(&mut self.child).await;
        self.reader.abort();
        if let Some(stderr) = self.stderr {
            stderr.abort();
        }
    }
}

async fn write_frame(
    stdin: &mut tokio::process::ChildStdin,
    msg: &[u8],
) -> std::io::Result<()> {
    stdin.write_all(msg).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Wait for the child to exit, killing it after the grace period.
async fn reap(child: &mut Child) -> Option<i32> {
    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            tracing::warn!("Failed to wait for MCP server process: {e}");
            None
        }
        Err(_) => {
            tracing::warn!("MCP server did not exit in time, killing it");
            let _ = child.kill().await;
            None
        }
    }
}

impl Transport for StdioTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let mut slot = self.shared.lock();
            if slot.is_some() {
                return Err(TransportError::AlreadyConnected);
            }

            self.shared.states.emit(TransportState::Connecting);
            match self.shared.spawn() {
                Ok(process) => {
                    tracing::info!(
                        "Started MCP server '{}' (pid {:?})",
                        self.shared.config.command,
                        process.child.id()
                    );
                    *slot = Some(process);
                    // Emitted under the lock so an immediate exit is
                    // reported after Connected, never before.
                    self.shared.states.emit(TransportState::Connected);
                    Ok(())
                }
                Err(e) => {
                    self.shared
                        .states
                        .emit(TransportState::Disconnected(Some(e.clone())));
                    Err(e)
                }
            }
        })
    }

    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let write_tx = self
                .shared
                .lock()
                .as_ref()
                .map(|process| process.write_tx.clone())
                .ok_or(TransportError::NotConnected)?;
            tracing::debug!("stdio -> {}", String::from_utf8_lossy(&message));
            write_tx
                .send(message)
                .await
                .map_err(|_| TransportError::Closed)
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
            let process = self.shared.lock().take();
            if let Some(process) = process {
                tracing::info!("Stopping MCP server '{}'", self.shared.config.command);
                process.shutdown().await;
            }
            self.shared.states.emit(TransportState::Disconnected(None));
            self.shared.messages.close();
            self.shared.states.close();
        })
    }

    fn name(&self) -> &str {
        "stdio"
    }
}
