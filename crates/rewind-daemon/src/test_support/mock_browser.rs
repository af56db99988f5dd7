//! In-memory browser for lifecycle and router tests.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rewind_common::mutex_lock_or_recover;
use rewind_common::now_millis;
use rewind_ipc::command::ElementState;
use rewind_ipc::command::WaitPolicy;
use rewind_log::EventPayload;
use rewind_log::TabId;
use serde_json::json;
use serde_json::Value;

use crate::capability::BrowserCapability;
use crate::capability::BrowserLauncher;
use crate::capability::LaunchSpec;
use crate::error::BrowserError;
use crate::ingest::Emitted;
use crate::ingest::EventSink;
use crate::ingest::IngestError;
use crate::session::Viewport;

#[derive(Debug, Clone)]
enum FailureKind {
    Timeout,
    Failed(String),
}

#[derive(Debug, Clone)]
struct Failure {
    kind: FailureKind,
    /// `None` fails forever.
    remaining: Option<u32>,
}

/// Records every call and answers from configured state.
///
/// `navigate` also emits a meta event for tab 0, the way a real capture
/// script reports a page load.
pub struct MockBrowser {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, Failure>>,
    delay: Option<Duration>,
    html: String,
    child_pids: Vec<u32>,
    closed: AtomicBool,
    sink: Mutex<Option<EventSink>>,
    viewport: Mutex<Viewport>,
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrowser {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            delay: None,
            html: "<html><body></body></html>".to_string(),
            child_pids: Vec::new(),
            closed: AtomicBool::new(false),
            sink: Mutex::new(None),
            viewport: Mutex::new(Viewport::default()),
        }
    }

    /// Every action sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    pub fn with_child_pids(mut self, pids: Vec<u32>) -> Self {
        self.child_pids = pids;
        self
    }

    pub fn failing(self, action: &str, message: impl Into<String>) -> Self {
        self.set_failure(action, FailureKind::Failed(message.into()), None);
        self
    }

    pub fn failing_times(self, action: &str, times: u32, message: impl Into<String>) -> Self {
        self.set_failure(action, FailureKind::Failed(message.into()), Some(times));
        self
    }

    pub fn timing_out(self, action: &str) -> Self {
        self.set_failure(action, FailureKind::Timeout, None);
        self
    }

    fn set_failure(&self, action: &str, kind: FailureKind, remaining: Option<u32>) {
        mutex_lock_or_recover(&self.failures).insert(action.to_string(), Failure { kind, remaining });
    }

    pub fn attach(&self, sink: EventSink) {
        *mutex_lock_or_recover(&self.sink) = Some(sink);
    }

    /// Emits a captured event as the page would.
    pub async fn emit(&self, tab: u32, event: Value) -> Result<Emitted, IngestError> {
        let sink = mutex_lock_or_recover(&self.sink).clone();
        match sink {
            Some(sink) => sink.emit(TabId(tab), EventPayload::new(event)).await,
            None => Err(IngestError::Closed),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        mutex_lock_or_recover(&self.calls).clone()
    }

    pub fn call_count(&self, action: &str) -> usize {
        mutex_lock_or_recover(&self.calls)
            .iter()
            .filter(|c| c.split(' ').next() == Some(action))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn viewport(&self) -> Viewport {
        *mutex_lock_or_recover(&self.viewport)
    }

    async fn act(&self, action: &str, detail: impl Into<String>) -> Result<(), BrowserError> {
        let detail = detail.into();
        let call = if detail.is_empty() {
            action.to_string()
        } else {
            format!("{} {}", action, detail)
        };
        mutex_lock_or_recover(&self.calls).push(call);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if action != "close" && self.is_closed() {
            return Err(BrowserError::Closed);
        }

        let failure = {
            let mut failures = mutex_lock_or_recover(&self.failures);
            match failures.get_mut(action) {
                Some(failure) => match failure.remaining {
                    Some(0) => None,
                    Some(ref mut n) => {
                        *n -= 1;
                        Some(failure.kind.clone())
                    }
                    None => Some(failure.kind.clone()),
                },
                None => None,
            }
        };
        match failure {
            Some(FailureKind::Timeout) => Err(BrowserError::Timeout {
                action: action.to_string(),
            }),
            Some(FailureKind::Failed(message)) => Err(BrowserError::action_failed(action, message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BrowserCapability for MockBrowser {
    async fn navigate(&self, url: &str, _wait: WaitPolicy) -> Result<(), BrowserError> {
        self.act("navigate", url).await?;
        let meta = json!({
            "type": 4,
            "timestamp": now_millis(),
            "data": { "href": url },
        });
        let _ = self.emit(0, meta).await;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.act("click", selector).await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        self.act("type", format!("{} {}", selector, text)).await
    }

    async fn hover(&self, selector: &str) -> Result<(), BrowserError> {
        self.act("hover", selector).await
    }

    async fn select(&self, selector: &str, values: &[String]) -> Result<Vec<String>, BrowserError> {
        self.act("select", selector).await?;
        Ok(values.to_vec())
    }

    async fn upload(&self, selector: &str, files: &[PathBuf]) -> Result<(), BrowserError> {
        self.act("upload", format!("{} {}", selector, files.len())).await
    }

    async fn evaluate(&self, expression: &str, args: &[Value]) -> Result<Value, BrowserError> {
        self.act("evaluate", expression).await?;
        Ok(json!({ "expression": expression, "args": args }))
    }

    async fn wait_for(
        &self,
        selector: &str,
        _state: ElementState,
        _timeout: Option<Duration>,
    ) -> Result<(), BrowserError> {
        self.act("wait_for", selector).await
    }

    async fn resize(&self, viewport: Viewport) -> Result<(), BrowserError> {
        self.act("resize", format!("{}x{}", viewport.width, viewport.height))
            .await?;
        *mutex_lock_or_recover(&self.viewport) = viewport;
        Ok(())
    }

    async fn screenshot(&self, path: &Path, _full_page: bool) -> Result<(), BrowserError> {
        self.act("screenshot", path.display().to_string()).await
    }

    async fn snapshot_html(&self) -> Result<String, BrowserError> {
        self.act("snapshot_html", "").await?;
        Ok(self.html.clone())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.act("close", "").await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn child_pids(&self) -> Vec<u32> {
        self.child_pids.clone()
    }
}

type BrowserFactory = Box<dyn Fn() -> MockBrowser + Send + Sync>;

/// Hands out a fresh [`MockBrowser`] per launch and keeps them for
/// inspection.
pub struct MockLauncher {
    factory: BrowserFactory,
    launch_error: Mutex<Option<String>>,
    launches: Mutex<Vec<LaunchSpec>>,
    browsers: Mutex<Vec<Arc<MockBrowser>>>,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::with_browser(MockBrowser::new)
    }

    pub fn with_browser(factory: impl Fn() -> MockBrowser + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            launch_error: Mutex::new(None),
            launches: Mutex::new(Vec::new()),
            browsers: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_launch(self, message: impl Into<String>) -> Self {
        *mutex_lock_or_recover(&self.launch_error) = Some(message.into());
        self
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        mutex_lock_or_recover(&self.launches).clone()
    }

    pub fn browsers(&self) -> Vec<Arc<MockBrowser>> {
        mutex_lock_or_recover(&self.browsers).clone()
    }

    pub fn last_browser(&self) -> Option<Arc<MockBrowser>> {
        mutex_lock_or_recover(&self.browsers).last().cloned()
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        sink: EventSink,
    ) -> Result<Arc<dyn BrowserCapability>, BrowserError> {
        mutex_lock_or_recover(&self.launches).push(spec.clone());
        if let Some(message) = mutex_lock_or_recover(&self.launch_error).clone() {
            return Err(BrowserError::Launch(message));
        }
        let browser = Arc::new((self.factory)());
        browser.attach(sink);
        mutex_lock_or_recover(&self.browsers).push(Arc::clone(&browser));
        Ok(browser)
    }
}
