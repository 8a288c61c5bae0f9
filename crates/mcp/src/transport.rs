//! Stdio transport: JSON-RPC over the standard streams of one provider process.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::StreamExt,
    serde_json::Value,
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
        sync::{oneshot, watch},
        task::JoinHandle,
    },
    tokio_util::{codec::FramedRead, sync::CancellationToken},
    tracing::{debug, trace, warn},
};

use crate::{
    codec::LineCodec,
    error::{Error, Result},
    launcher::{ExitKind, ProcessIo, ProviderProcess},
    types::{
        IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, response_id,
    },
};

/// How long the reader waits for the exit status after stdout closes.
const EXIT_SETTLE: Duration = Duration::from_secs(2);
/// How long to wait for the process to be reaped after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client asked for the shutdown.
    ExplicitStop,
    /// The provider exited with status zero on its own.
    CleanExit,
    /// Non-zero exit, signal, stream error, or stdout closed while the
    /// process stayed alive.
    Crash,
}

impl DisconnectReason {
    pub fn is_explicit(self) -> bool {
        matches!(self, Self::ExplicitStop)
    }
}

/// Callback receiving provider notifications, in arrival order.
pub type NotificationSink = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Outstanding requests keyed by correlation id.
///
/// Every entry leaves the table exactly once: matched by a response, removed
/// by its timeout, or dropped on disconnect (which the waiter observes as a
/// closed channel). Once closed the table accepts no new entries.
#[derive(Default)]
struct PendingTable {
    inner: Mutex<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: bool,
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: u64) -> Option<oneshot::Receiver<JsonRpcResponse>> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);
        Some(rx)
    }

    fn complete(&self, id: u64, response: JsonRpcResponse) -> bool {
        match self.lock().waiters.remove(&id) {
            Some(tx) => {
                let _ = tx.send(response);
                true
            },
            None => false,
        }
    }

    fn remove(&self, id: u64) -> bool {
        self.lock().waiters.remove(&id).is_some()
    }

    /// Drop every waiter and refuse new ones.
    fn close(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let count = inner.waiters.len();
        inner.waiters.clear();
        count
    }

    fn len(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// Transport for one provider process. A new transport is created for every
/// connection attempt; it is never reused after it closes.
pub struct StdioTransport {
    server: String,
    writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    stopping: Arc<AtomicBool>,
    closed: Arc<watch::Sender<Option<DisconnectReason>>>,
    exit: watch::Receiver<Option<ExitKind>>,
    kill: CancellationToken,
    /// Reader and stderr tasks; aborted on shutdown or drop.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Wire up a launched process: start the stdout reader, the stderr
    /// logger and the exit monitor.
    pub fn start(server: &str, io: ProcessIo, notifications: NotificationSink) -> Arc<Self> {
        let ProcessIo {
            stdin,
            stdout,
            stderr,
            process,
        } = io;

        let pending = Arc::new(PendingTable::default());
        let stopping = Arc::new(AtomicBool::new(false));
        let (closed_tx, _) = watch::channel(None);
        let closed = Arc::new(closed_tx);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();

        tokio::spawn(monitor_exit(server.to_string(), process, exit_tx, kill.clone()));

        let mut tasks = Vec::new();
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(log_stderr(server.to_string(), stderr)));
        }
        tasks.push(tokio::spawn(read_loop(ReaderContext {
            server: server.to_string(),
            stdout,
            pending: Arc::clone(&pending),
            notifications,
            stopping: Arc::clone(&stopping),
            closed: Arc::clone(&closed),
            exit: exit_rx.clone(),
            kill: kill.clone(),
        })));

        Arc::new(Self {
            server: server.to_string(),
            writer: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            stopping,
            closed,
            exit: exit_rx,
            kill,
            tasks: Mutex::new(tasks),
        })
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// Returns the `result` payload; a JSON-RPC error object becomes
    /// [`Error::Rpc`].
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let Some(rx) = self.pending.insert(id) else {
            return Err(Error::ConnectionClosed);
        };

        debug!(server = %self.server, method = %method, id = %id, "client -> provider");
        if let Err(e) = self.write_line(&serde_json::to_string(&req)?).await {
            self.pending.remove(id);
            return Err(e);
        }

        let resp = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.remove(id);
                return Err(Error::RequestTimeout {
                    method: method.to_string(),
                    timeout,
                });
            },
        };

        if let Some(err) = resp.error {
            return Err(Error::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        trace!(server = %self.server, method = %method, "client -> provider (notification)");
        self.write_line(&serde_json::to_string(&notif)?).await
    }

    async fn write_line(&self, payload: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Resolve once the connection has ended, with the reason.
    pub async fn closed(&self) -> DisconnectReason {
        let mut rx = self.closed.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.unwrap_or(DisconnectReason::Crash),
            Err(_) => DisconnectReason::Crash,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop the provider: reject pending requests, close stdin so the
    /// provider can exit on its own, and kill it if it is still running
    /// after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.stopping.store(true, Ordering::SeqCst);
        let rejected = self.pending.close();
        if rejected > 0 {
            debug!(server = %self.server, rejected, "rejected pending requests on shutdown");
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let mut exit = self.exit.clone();
        if tokio::time::timeout(grace, exit.wait_for(Option::is_some))
            .await
            .is_err()
        {
            warn!(
                server = %self.server,
                grace_ms = grace.as_millis() as u64,
                "provider did not exit after stdin closed, killing"
            );
            self.kill.cancel();
            let _ = tokio::time::timeout(KILL_WAIT, exit.wait_for(Option::is_some)).await;
        }

        self.abort_tasks();
        self.closed.send_if_modified(|reason| {
            if reason.is_none() {
                *reason = Some(DisconnectReason::ExplicitStop);
                true
            } else {
                false
            }
        });
    }

    fn abort_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.abort_tasks();
        self.kill.cancel();
    }
}

struct ReaderContext {
    server: String,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    pending: Arc<PendingTable>,
    notifications: NotificationSink,
    stopping: Arc<AtomicBool>,
    closed: Arc<watch::Sender<Option<DisconnectReason>>>,
    exit: watch::Receiver<Option<ExitKind>>,
    kill: CancellationToken,
}

async fn read_loop(ctx: ReaderContext) {
    let ReaderContext {
        server,
        stdout,
        pending,
        notifications,
        stopping,
        closed,
        mut exit,
        kill,
    } = ctx;

    let mut frames = FramedRead::new(stdout, LineCodec::default());
    let mut stream_failed = false;
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(line) => dispatch_line(&server, line.trim(), &pending, &notifications),
            Err(e) => {
                warn!(server = %server, error = %e, "error reading provider stdout");
                stream_failed = true;
                break;
            },
        }
    }
    debug!(server = %server, "provider stdout closed");

    pending.close();

    let reason = if stopping.load(Ordering::SeqCst) {
        DisconnectReason::ExplicitStop
    } else {
        let status = tokio::time::timeout(EXIT_SETTLE, exit.wait_for(Option::is_some))
            .await
            .ok()
            .and_then(|r| r.ok().and_then(|kind| *kind));
        match status {
            Some(ExitKind::Success) if !stream_failed => DisconnectReason::CleanExit,
            Some(_) => DisconnectReason::Crash,
            None => {
                warn!(server = %server, "provider closed stdout but kept running, killing");
                kill.cancel();
                DisconnectReason::Crash
            },
        }
    };

    closed.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

fn dispatch_line(
    server: &str,
    line: &str,
    pending: &PendingTable,
    notifications: &NotificationSink,
) {
    if line.is_empty() {
        return;
    }
    trace!(server = %server, raw = %line, "provider -> client");

    match IncomingMessage::parse(line) {
        Ok(IncomingMessage::Response(resp)) => match response_id(&resp.id) {
            Some(id) => {
                if !pending.complete(id, resp) {
                    debug!(server = %server, id, "ignoring response for unknown request id");
                }
            },
            None => debug!(server = %server, id = %resp.id, "ignoring response with foreign id"),
        },
        Ok(IncomingMessage::Notification(notif)) => {
            debug!(server = %server, method = %notif.method, "provider notification");
            notifications(notif);
        },
        Err(e) => {
            warn!(server = %server, error = %e, "dropping malformed provider message");
        },
    }
}

async fn monitor_exit(
    server: String,
    mut process: Box<dyn ProviderProcess>,
    exit: watch::Sender<Option<ExitKind>>,
    kill: CancellationToken,
) {
    let kind = tokio::select! {
        status = process.wait() => status.unwrap_or_else(|e| {
            warn!(server = %server, error = %e, "failed to wait for provider process");
            ExitKind::Failure
        }),
        () = kill.cancelled() => {
            if let Err(e) = process.kill().await {
                warn!(server = %server, error = %e, "failed to kill provider process");
            }
            ExitKind::Failure
        },
    };
    debug!(server = %server, exit = ?kind, "provider process exited");
    exit.send_replace(Some(kind));
}

async fn log_stderr(server: String, stderr: Box<dyn AsyncRead + Send + Unpin>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    warn!(server = %server, stderr = %trimmed, "provider stderr");
                }
            },
            Ok(None) | Err(_) => break,
        }
    }
}
