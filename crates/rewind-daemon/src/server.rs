//! Line-delimited JSON control server over a Unix socket.
//!
//! Each connection has one reader and one writer. Pings are answered
//! inline; actions run as independent tasks, so responses on a connection
//! may complete out of order and are matched by id.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use rewind_common::ErrorKind;
use rewind_ipc::Command;
use rewind_ipc::Request;
use rewind_ipc::RequestKind;
use rewind_ipc::Response;
use serde_json::Value;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::DaemonError;
use crate::handler::ActionHandler;
use crate::lifecycle::ControlEndpoint;
use crate::shutdown::ShutdownSignal;

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const RESPONSE_QUEUE: usize = 64;

/// Counts open connections and requests still being handled.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    connections: AtomicUsize,
    in_flight: AtomicUsize,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn connection(self: &Arc<Self>) -> TrackerGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        TrackerGuard {
            tracker: Arc::clone(self),
            slot: Slot::Connection,
        }
    }

    pub fn request(self: &Arc<Self>) -> TrackerGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        TrackerGuard {
            tracker: Arc::clone(self),
            slot: Slot::Request,
        }
    }

    /// Waits until no request is in flight. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.in_flight();
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(pending, "Timed out waiting for in-flight requests");
                return false;
            }
            debug!(pending, "Waiting for in-flight requests");
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Connection,
    Request,
}

/// Releases its slot in the tracker when dropped.
#[derive(Debug)]
pub struct TrackerGuard {
    tracker: Arc<ConnectionTracker>,
    slot: Slot,
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        let counter = match self.slot {
            Slot::Connection => &self.tracker.connections,
            Slot::Request => &self.tracker.in_flight,
        };
        counter.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ConnectionContext {
    handler: Option<Arc<dyn ActionHandler>>,
    tracker: Arc<ConnectionTracker>,
    shutdown: ShutdownSignal,
    max_request_bytes: usize,
}

pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    shutdown: ShutdownSignal,
    tracker: Arc<ConnectionTracker>,
    handler: Option<Arc<dyn ActionHandler>>,
    max_request_bytes: usize,
}

impl ControlServer {
    /// Binds the endpoint, replacing a stale socket file left by a
    /// previous recorder. Must run inside a tokio runtime.
    pub fn bind(socket_path: impl Into<PathBuf>, shutdown: ShutdownSignal) -> Result<Self, DaemonError> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DaemonError::SocketBind(format!(
                    "failed to create '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                DaemonError::SocketBind(format!("failed to remove stale socket: {}", e))
            })?;
        }
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| DaemonError::SocketBind(format!("failed to bind socket: {}", e)))?;
        info!(socket = %socket_path.display(), "Control server listening");

        Ok(Self {
            listener,
            socket_path,
            shutdown,
            tracker: Arc::new(ConnectionTracker::new()),
            handler: None,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        })
    }

    pub fn with_handler(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max.max(1);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn endpoint(&self) -> ControlEndpoint {
        ControlEndpoint {
            socket_path: self.socket_path.clone(),
            shutdown: self.shutdown.clone(),
            tracker: Arc::clone(&self.tracker),
        }
    }

    /// Accepts connections until shutdown is triggered, then removes the
    /// socket file. Connections already open finish their in-flight work.
    pub async fn run(self) {
        let ctx = Arc::new(ConnectionContext {
            handler: self.handler,
            tracker: Arc::clone(&self.tracker),
            shutdown: self.shutdown.clone(),
            max_request_bytes: self.max_request_bytes,
        });

        loop {
            tokio::select! {
                _ = self.shutdown.triggered() => {
                    info!("Control server no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(serve_connection(stream, ctx));
                    }
                    Err(e) => {
                        warn!(error = %e, "Error accepting connection");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        drop(self.listener);
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(socket = %self.socket_path.display(), "Removed socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to remove socket"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line,
    Eof,
    Oversize,
}

/// Reads one newline-terminated frame into `buf`, stopping after
/// `max + 1` bytes so an unterminated flood cannot grow it further.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let n = reader.take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > max {
        return Ok(Frame::Oversize);
    }
    Ok(Frame::Line)
}

/// Parses a request line. A line that is valid JSON carrying a string id
/// is answered under that id; anything else gets the sentinel id.
fn decode(line: &[u8]) -> Result<Request, Response> {
    serde_json::from_slice::<Request>(line).map_err(|e| {
        let id = serde_json::from_slice::<Value>(line)
            .ok()
            .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string));
        match id {
            Some(id) => Response::failure(id, ErrorKind::ProtocolError, format!("Invalid request: {}", e)),
            None => Response::parse_error(format!("Parse error: {}", e)),
        }
    })
}

async fn serve_connection(stream: UnixStream, ctx: Arc<ConnectionContext>) {
    let _connection = ctx.tracker.connection();
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Response>(RESPONSE_QUEUE);
    let writer = tokio::spawn(write_responses(write_half, rx));
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();

    loop {
        let frame = tokio::select! {
            _ = ctx.shutdown.triggered() => break,
            frame = read_frame(&mut reader, &mut buf, ctx.max_request_bytes) => frame,
        };
        match frame {
            Ok(Frame::Line) => {}
            Ok(Frame::Eof) => break,
            Ok(Frame::Oversize) => {
                warn!(max_bytes = ctx.max_request_bytes, "Request exceeds size limit, closing connection");
                let _ = tx
                    .send(Response::parse_error(format!(
                        "Parse error: request exceeds {} bytes",
                        ctx.max_request_bytes
                    )))
                    .await;
                break;
            }
            Err(e) => {
                debug!(error = %e, "Client connection error");
                break;
            }
        }

        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let request = match decode(&buf) {
            Ok(request) => request,
            Err(response) => {
                debug!(id = %response.id, "Rejected malformed request");
                if tx.send(response).await.is_err() {
                    break;
                }
                continue;
            }
        };

        match request.kind {
            RequestKind::Ping => {
                if tx.send(Response::pong(request.id)).await.is_err() {
                    break;
                }
            }
            RequestKind::Action => {
                let guard = ctx.tracker.request();
                let handler = ctx.handler.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let response = dispatch(handler.as_deref(), request).await;
                    let _ = tx.send(response).await;
                });
            }
        }
    }

    // The writer finishes once every spawned action has replied.
    drop(tx);
    let _ = writer.await;
}

async fn write_responses(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Response>) {
    while let Some(response) = rx.recv().await {
        if let Err(e) = writer.write_all(response.to_line().as_bytes()).await {
            debug!(error = %e, "Client write error");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn dispatch(handler: Option<&dyn ActionHandler>, request: Request) -> Response {
    let Request { id, tool, args, .. } = request;
    let Some(handler) = handler else {
        return Response::failure(id, ErrorKind::Unhandled, "No action handler is registered");
    };
    let Some(tool) = tool else {
        return Response::failure(id, ErrorKind::ProtocolError, "Action request is missing 'tool'");
    };
    let command = match Command::parse(&tool, args) {
        Ok(command) => command,
        Err(e) => return Response::failure(id, e.kind(), e.to_string()),
    };

    let started = Instant::now();
    let result = handler.handle(command).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(value) => {
            debug!(%id, %tool, elapsed_ms, "Action completed");
            Response::success(id, value)
        }
        Err(e) => {
            debug!(%id, %tool, elapsed_ms, kind = %e.kind, error = %e.message, "Action failed");
            Response::failure(id, e.kind, e.message)
        }
    }
}
