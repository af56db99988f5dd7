use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use rewind_common::mutex_lock_or_recover;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::command::Command;
use crate::error::ClientError;
use crate::types::Request;
use crate::types::RequestKind;
use crate::types::Response;

pub mod polling {
    use std::time::Duration;

    pub const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(50);
    pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);
}

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Exponential backoff for reaching an endpoint that may not be up yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 50,
            initial_delay: polling::INITIAL_POLL_INTERVAL,
            max_delay: polling::MAX_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            request_timeout: std::env::var("REWIND_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

type Waiter = oneshot::Sender<Result<Response, ClientError>>;

#[derive(Default)]
struct PendingTable {
    closed: bool,
    waiters: HashMap<String, Waiter>,
}

/// One connection to a recorder's control endpoint.
///
/// Requests may be issued concurrently from several tasks; replies are
/// matched to callers by correlation id regardless of arrival order.
pub struct ControlClient {
    path: PathBuf,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<PendingTable>>,
    reader: JoinHandle<()>,
    timeout: Duration,
}

impl ControlClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        Self::connect_with_config(path, &ClientConfig::default()).await
    }

    pub async fn connect_with_config(
        path: impl AsRef<Path>,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| ClientError::from_connect(path.to_path_buf(), e))?;
        let (read, write) = stream.into_split();
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let reader = tokio::spawn(read_replies(read, Arc::clone(&pending)));
        Ok(Self {
            path: path.to_path_buf(),
            writer: tokio::sync::Mutex::new(write),
            pending,
            reader,
            timeout: config.request_timeout,
        })
    }

    /// Polls until the endpoint accepts a connection. Only "not running"
    /// is retried; other failures return at once.
    pub async fn connect_with_retry(
        path: impl AsRef<Path>,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let policy = config.retry;
        let mut delay = policy.initial_delay;
        let mut attempt = 1;
        loop {
            match Self::connect_with_config(path, config).await {
                Err(ClientError::NotRunning { .. }) if attempt < policy.attempts => {
                    debug!(path = %path.display(), attempt, "Recorder not up yet, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(policy.max_delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Round-trip time of a ping.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        let response = self.request(RequestKind::Ping, None, None).await?;
        into_result(response)?;
        Ok(started.elapsed())
    }

    /// Runs `command` on the recorder. An `ok:false` reply becomes
    /// [`ClientError::Remote`] carrying the recorder's error kind.
    pub async fn action(&self, command: &Command) -> Result<Value, ClientError> {
        let response = self
            .request(RequestKind::Action, Some(command.tool()), command.args())
            .await?;
        into_result(response)
    }

    /// Sends one request under a fresh correlation id and returns the raw
    /// reply, successful or not.
    pub async fn request(
        &self,
        kind: RequestKind,
        tool: Option<&str>,
        args: Option<Value>,
    ) -> Result<Response, ClientError> {
        let request = Request {
            id: Uuid::new_v4().to_string(),
            kind,
            tool: tool.map(str::to_string),
            args,
        };
        self.send(request).await
    }

    pub async fn send(&self, request: Request) -> Result<Response, ClientError> {
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut table = mutex_lock_or_recover(&self.pending);
            if table.closed {
                return Err(ClientError::ConnectionClosed);
            }
            if table.waiters.contains_key(&id) {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("request id {} is already in flight", id),
                )));
            }
            table.waiters.insert(id.clone(), tx);
        }

        let mut line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => {
                self.forget(&id);
                return Err(e.into());
            }
        };
        line.push('\n');

        // The deadline covers waiting for the writer, the write itself and
        // the reply.
        let mut write_started = false;
        let mut write_done = false;
        let exchange = async {
            let mut writer = self.writer.lock().await;
            write_started = true;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
            drop(writer);
            write_done = true;
            Ok::<_, std::io::Error>(rx.await)
        };
        let outcome = tokio::time::timeout(self.timeout, exchange).await;

        match outcome {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(_))) => Err(ClientError::ConnectionClosed),
            Ok(Err(e)) => {
                self.forget(&id);
                Err(ClientError::Io(e))
            }
            Err(_) => {
                self.forget(&id);
                if write_started && !write_done {
                    // A partial frame is on the wire; nothing after it
                    // would parse.
                    self.abandon(&id);
                }
                // Otherwise the server keeps running the request; its
                // reply, if any, finds no waiter and is dropped.
                Err(ClientError::Timeout {
                    id,
                    after: self.timeout,
                })
            }
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        mutex_lock_or_recover(&self.pending).waiters.len()
    }

    pub async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
        self.reader.abort();
        reject_all(&self.pending);
    }

    fn forget(&self, id: &str) {
        mutex_lock_or_recover(&self.pending).waiters.remove(id);
    }

    fn abandon(&self, id: &str) {
        warn!(id, path = %self.path.display(), "Write timed out mid-frame, closing connection");
        self.reader.abort();
        reject_all(&self.pending);
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn into_result(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.result.unwrap_or(Value::Null));
    }
    match response.error {
        Some(error) => Err(error.into()),
        None => Err(ClientError::InvalidResponse(format!(
            "reply {} has ok:false without an error",
            response.id
        ))),
    }
}

async fn read_replies(read: OwnedReadHalf, pending: Arc<Mutex<PendingTable>>) {
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Response>(&line) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "Ignoring unparsable reply line");
                        continue;
                    }
                };
                let waiter = mutex_lock_or_recover(&pending)
                    .waiters
                    .remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => debug!(id = %response.id, "Dropping reply with no waiting request"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Control channel read failed");
                break;
            }
        }
    }
    reject_all(&pending);
}

fn reject_all(pending: &Mutex<PendingTable>) {
    let mut table = mutex_lock_or_recover(pending);
    table.closed = true;
    for (_, waiter) in table.waiters.drain() {
        let _ = waiter.send(Err(ClientError::ConnectionClosed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_common::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_into_result_maps_failures() {
        assert_eq!(
            into_result(Response::success("a", json!(1))).unwrap(),
            json!(1)
        );
        let err = into_result(Response::failure("b", ErrorKind::NotFound, "gone")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let malformed = Response {
            id: "c".into(),
            ok: false,
            result: None,
            error: None,
        };
        assert!(matches!(
            into_result(malformed),
            Err(ClientError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_config_builders() {
        let config = ClientConfig::default()
            .with_request_timeout(Duration::from_millis(10))
            .with_retry(RetryPolicy {
                attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            });
        assert_eq!(config.request_timeout, Duration::from_millis(10));
        assert_eq!(config.retry.attempts, 2);
    }

    #[tokio::test]
    async fn test_connect_to_absent_endpoint_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let err = match ControlClient::connect(dir.path().join("none.sock")).await {
            Err(err) => err,
            Ok(_) => panic!("connected to a missing socket"),
        };
        assert_eq!(err.kind(), ErrorKind::NotRunning);
    }
}
