//! A browser driven by a child process speaking line-delimited JSON.
//!
//! Requests go to the driver's stdin as `{"id","method","params"}`. Its
//! stdout carries replies `{"id","ok","result"?,"error"?}` and captured
//! events `{"tabId","event"}`, interleaved.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rewind_common::mutex_lock_or_recover;
use rewind_ipc::command::ElementState;
use rewind_ipc::command::WaitPolicy;
use rewind_log::EventPayload;
use rewind_log::TabId;
use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::split_command;
use crate::capability::BrowserCapability;
use crate::capability::BrowserLauncher;
use crate::capability::LaunchSpec;
use crate::config::RecorderConfig;
use crate::error::BrowserError;
use crate::ingest::EventSink;
use crate::session::Viewport;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type Reply = Result<Value, BrowserError>;

struct Pending {
    method: String,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, Pending>>,
    closed: AtomicBool,
}

impl Shared {
    fn fail_pending(&self) {
        let drained: Vec<Pending> = mutex_lock_or_recover(&self.pending)
            .drain()
            .map(|(_, p)| p)
            .collect();
        for pending in drained {
            let _ = pending.tx.send(Err(BrowserError::Closed));
        }
    }
}

pub struct StdioLauncher {
    command: String,
}

impl StdioLauncher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn from_config(config: &RecorderConfig) -> Option<Self> {
        config.browser_cmd.as_deref().map(Self::new)
    }
}

#[async_trait]
impl BrowserLauncher for StdioLauncher {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        sink: EventSink,
    ) -> Result<Arc<dyn BrowserCapability>, BrowserError> {
        let browser = StdioBrowser::spawn(&self.command, spec, sink).await?;
        Ok(Arc::new(browser))
    }
}

pub struct StdioBrowser {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    next_id: AtomicU64,
    shared: Arc<Shared>,
}

impl StdioBrowser {
    /// Spawns the driver and waits for it to acknowledge `launch`.
    pub async fn spawn(command: &str, spec: &LaunchSpec, sink: EventSink) -> Result<Self, BrowserError> {
        let (program, args) = split_command(command)
            .ok_or_else(|| BrowserError::Launch("browser command is empty".to_string()))?;
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrowserError::Launch(format!("failed to spawn '{}': {}", program, e)))?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrowserError::Launch("driver stdout is not piped".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let shared = Arc::new(Shared::default());
        tokio::spawn(read_driver(stdout, Arc::clone(&shared), sink));

        let browser = Self {
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(Some(child)),
            pid,
            next_id: AtomicU64::new(1),
            shared,
        };
        let params = serde_json::to_value(spec)
            .map_err(|e| BrowserError::Protocol(format!("failed to encode launch spec: {}", e)))?;
        if let Err(e) = browser.request("launch", params).await {
            let _ = browser.close().await;
            return Err(BrowserError::Launch(e.to_string()));
        }
        info!(program = %program, pid = ?pid, run_id = %spec.run_id, "Browser driver started");
        Ok(browser)
    }

    async fn request(&self, method: &str, params: Value) -> Reply {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BrowserError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        mutex_lock_or_recover(&self.shared.pending).insert(
            id,
            Pending {
                method: method.to_string(),
                tx,
            },
        );

        let mut line = json!({ "id": id, "method": method, "params": params }).to_string();
        line.push('\n');
        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.as_mut() {
                Some(stdin) => match stdin.write_all(line.as_bytes()).await {
                    Ok(()) => stdin.flush().await.map_err(BrowserError::Io),
                    Err(e) => Err(BrowserError::Io(e)),
                },
                None => Err(BrowserError::Closed),
            }
        };
        if let Err(e) = written {
            mutex_lock_or_recover(&self.shared.pending).remove(&id);
            return Err(e);
        }

        rx.await.unwrap_or(Err(BrowserError::Closed))
    }

    async fn call(&self, method: &str, params: Value) -> Result<(), BrowserError> {
        self.request(method, params).await.map(|_| ())
    }
}

#[async_trait]
impl BrowserCapability for StdioBrowser {
    async fn navigate(&self, url: &str, wait: WaitPolicy) -> Result<(), BrowserError> {
        self.call("navigate", json!({ "url": url, "wait": wait })).await
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.call("click", json!({ "selector": selector })).await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        self.call("type", json!({ "selector": selector, "text": text }))
            .await
    }

    async fn hover(&self, selector: &str) -> Result<(), BrowserError> {
        self.call("hover", json!({ "selector": selector })).await
    }

    async fn select(&self, selector: &str, values: &[String]) -> Result<Vec<String>, BrowserError> {
        let result = self
            .request("select", json!({ "selector": selector, "values": values }))
            .await?;
        match result {
            Value::Null => Ok(values.to_vec()),
            other => serde_json::from_value(other)
                .map_err(|e| BrowserError::Protocol(format!("select result: {}", e))),
        }
    }

    async fn upload(&self, selector: &str, files: &[PathBuf]) -> Result<(), BrowserError> {
        self.call("upload", json!({ "selector": selector, "files": files }))
            .await
    }

    async fn evaluate(&self, expression: &str, args: &[Value]) -> Result<Value, BrowserError> {
        self.request("evaluate", json!({ "expression": expression, "args": args }))
            .await
    }

    async fn wait_for(
        &self,
        selector: &str,
        state: ElementState,
        timeout: Option<Duration>,
    ) -> Result<(), BrowserError> {
        let timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self.call(
            "wait_for",
            json!({ "selector": selector, "state": state, "timeoutMs": timeout_ms }),
        )
        .await
    }

    async fn resize(&self, viewport: Viewport) -> Result<(), BrowserError> {
        self.call("resize", json!(viewport)).await
    }

    async fn screenshot(&self, path: &Path, full_page: bool) -> Result<(), BrowserError> {
        self.call("screenshot", json!({ "path": path, "fullPage": full_page }))
            .await
    }

    async fn snapshot_html(&self) -> Result<String, BrowserError> {
        match self.request("snapshot_html", Value::Null).await? {
            Value::String(html) => Ok(html),
            other => Err(BrowserError::Protocol(format!(
                "snapshot_html returned {}",
                other
            ))),
        }
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        if !self.shared.closed.load(Ordering::Acquire) {
            if let Err(e) = tokio::time::timeout(CLOSE_TIMEOUT, self.call("close", Value::Null)).await {
                debug!(error = %e, "Driver did not acknowledge close");
            }
        }
        self.shared.closed.store(true, Ordering::Release);
        self.stdin.lock().await.take();

        match tokio::time::timeout(CLOSE_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Browser driver exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for browser driver"),
            Err(_) => {
                warn!(pid = ?self.pid, "Browser driver did not exit, killing");
                child.kill().await?;
            }
        }
        self.shared.fail_pending();
        Ok(())
    }

    fn child_pids(&self) -> Vec<u32> {
        self.pid.into_iter().collect()
    }
}

fn reply_error(method: &str, error: Option<&Value>) -> BrowserError {
    let (kind, message) = match error {
        Some(Value::String(message)) => (None, message.clone()),
        Some(Value::Object(fields)) => (
            fields.get("kind").and_then(Value::as_str),
            fields
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        ),
        _ => (None, "unknown error".to_string()),
    };
    match kind {
        Some("timeout") => BrowserError::Timeout {
            action: method.to_string(),
        },
        _ => BrowserError::action_failed(method, message),
    }
}

async fn read_driver(stdout: ChildStdout, shared: Arc<Shared>, sink: EventSink) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from browser driver");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Skipping malformed line from browser driver");
                continue;
            }
        };

        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            let Some(pending) = mutex_lock_or_recover(&shared.pending).remove(&id) else {
                debug!(id, "Reply for unknown request");
                continue;
            };
            let ok = message.get("ok").and_then(Value::as_bool).unwrap_or(false);
            let reply = if ok {
                Ok(message.get("result").cloned().unwrap_or(Value::Null))
            } else {
                Err(reply_error(&pending.method, message.get("error")))
            };
            let _ = pending.tx.send(reply);
        } else if let (Some(tab), Some(event)) = (
            message.get("tabId").and_then(Value::as_u64),
            message.get("event"),
        ) {
            let Ok(tab) = u32::try_from(tab) else {
                warn!(tab, "Event tab id out of range");
                continue;
            };
            let event = EventPayload::new(event.clone());
            if sink.emit(TabId(tab), event).await.is_err() {
                debug!("Ingest closed, discarding driver event");
            }
        } else {
            warn!("Unrecognised message from browser driver");
        }
    }
    shared.closed.store(true, Ordering::Release);
    shared.fail_pending();
    debug!("Browser driver output closed");
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "rewind::driver", "{}", line);
    }
}
