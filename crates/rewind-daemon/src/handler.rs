//! The action handler registered on the control server.
//!
//! [`SessionRouter`] sends browser actions to the active session's
//! capability and answers recorder queries from the recording itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rewind_common::ErrorKind;
use rewind_ipc::command::ReplayArgs;
use rewind_ipc::command::ResolveArgs;
use rewind_ipc::Command;
use rewind_log::LogError;
use serde_json::json;
use serde_json::Value;
use tracing::debug;

use crate::capability::ReplayCapability;
use crate::capability::ReplayJob;
use crate::error::BrowserError;
use crate::error::LifecycleError;
use crate::error::ReplayError;
use crate::lifecycle::ActiveSession;
use crate::lifecycle::Lifecycle;
use crate::session::Viewport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ActionError {}

impl From<LogError> for ActionError {
    fn from(e: LogError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<BrowserError> for ActionError {
    fn from(e: BrowserError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<ReplayError> for ActionError {
    fn from(e: ReplayError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<LifecycleError> for ActionError {
    fn from(e: LifecycleError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<serde_json::Error> for ActionError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Internal, format!("failed to encode result: {}", e))
    }
}

impl From<tokio::task::JoinError> for ActionError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::new(ErrorKind::Internal, format!("background task failed: {}", e))
    }
}

/// Executes one parsed command. Registered once per server.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Result<Value, ActionError>;
}

pub struct SessionRouter {
    lifecycle: Arc<Lifecycle>,
    replay: Option<Arc<dyn ReplayCapability>>,
    replay_timeout: Duration,
}

impl SessionRouter {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        let replay_timeout = lifecycle.config().replay_timeout;
        Self {
            lifecycle,
            replay: None,
            replay_timeout,
        }
    }

    pub fn with_replay(mut self, replay: Arc<dyn ReplayCapability>) -> Self {
        self.replay = Some(replay);
        self
    }

    pub fn with_replay_timeout(mut self, timeout: Duration) -> Self {
        self.replay_timeout = timeout;
        self
    }

    fn session(&self) -> Result<Arc<ActiveSession>, ActionError> {
        self.lifecycle.current().ok_or_else(|| {
            ActionError::new(
                ErrorKind::Unhandled,
                format!("no active session (state: {})", self.lifecycle.state()),
            )
        })
    }

    fn status(&self) -> Result<Value, ActionError> {
        Ok(serde_json::to_value(self.lifecycle.status())?)
    }

    fn tabs(&self) -> Result<Value, ActionError> {
        let session = self.session()?;
        Ok(json!({ "tabs": session.tabs().list() }))
    }

    async fn resolve(&self, args: ResolveArgs) -> Result<Value, ActionError> {
        let session = self.session()?;
        let recorder = Arc::clone(session.recorder());
        let resolution =
            tokio::task::spawn_blocking(move || recorder.resolve(&args.locator, args.tab)).await??;
        Ok(json!({
            "resolution": resolution,
            "locator": resolution.locator().to_string(),
        }))
    }

    async fn replay(&self, args: ReplayArgs) -> Result<Value, ActionError> {
        let Some(replay) = self.replay.as_ref() else {
            return Err(ActionError::new(
                ErrorKind::Unhandled,
                "no replay capability is configured",
            ));
        };
        let session = self.session()?;
        let recorder = Arc::clone(session.recorder());
        let locator = args.locator;
        let tab = args.tab;
        let (resolution, events) = tokio::task::spawn_blocking(move || {
            let resolution = recorder.resolve(&locator, tab)?;
            let events = recorder.replay_slice(&resolution)?;
            Ok::<_, LogError>((resolution, events))
        })
        .await??;
        debug!(
            locator = %resolution.locator(),
            tab = %resolution.tab,
            events = events.len(),
            "Rendering replay"
        );

        let job = ReplayJob {
            events,
            viewport: session.viewport(),
            output: args.output,
            path: args.path,
        };
        // Expiry drops the render future; the capability is not told.
        let artifact = tokio::time::timeout(self.replay_timeout, replay.render(job))
            .await
            .map_err(|_| ReplayError::Timeout(self.replay_timeout))??;
        Ok(json!({
            "resolution": resolution,
            "locator": resolution.locator().to_string(),
            "artifact": artifact,
        }))
    }

    async fn browser_action(&self, command: Command) -> Result<Value, ActionError> {
        let session = self.session()?;
        let browser = session.browser();
        let result = match command {
            Command::Navigate(args) => {
                browser.navigate(&args.url, args.wait).await?;
                json!({ "url": args.url })
            }
            Command::Click(args) => {
                browser.click(&args.selector).await?;
                json!({ "selector": args.selector })
            }
            Command::Type(args) => {
                browser.type_text(&args.selector, &args.text).await?;
                json!({ "selector": args.selector })
            }
            Command::Hover(args) => {
                browser.hover(&args.selector).await?;
                json!({ "selector": args.selector })
            }
            Command::Select(args) => {
                let selected = browser.select(&args.selector, &args.values).await?;
                json!({ "selector": args.selector, "selected": selected })
            }
            Command::Upload(args) => {
                browser.upload(&args.selector, &args.files).await?;
                json!({ "selector": args.selector, "files": args.files.len() })
            }
            Command::Evaluate(args) => {
                let value = browser.evaluate(&args.expression, &args.args).await?;
                json!({ "value": value })
            }
            Command::WaitFor(args) => {
                let timeout = args.timeout_ms.map(Duration::from_millis);
                browser.wait_for(&args.selector, args.state, timeout).await?;
                json!({ "selector": args.selector, "state": args.state })
            }
            Command::Resize(args) => {
                let viewport = Viewport {
                    width: args.width,
                    height: args.height,
                };
                browser.resize(viewport).await?;
                session.set_viewport(viewport);
                serde_json::to_value(viewport)?
            }
            Command::Screenshot(args) => {
                browser.screenshot(&args.path, args.full_page).await?;
                json!({ "path": args.path })
            }
            Command::SnapshotHtml => {
                let html = browser.snapshot_html().await?;
                json!({ "html": html })
            }
            Command::Close => {
                browser.close().await?;
                json!({ "closed": true })
            }
            Command::Status | Command::Tabs | Command::Resolve(_) | Command::Replay(_) => {
                return Err(ActionError::new(
                    ErrorKind::Internal,
                    format!("'{}' is not a browser action", command.tool()),
                ))
            }
        };
        Ok(result)
    }
}

#[async_trait]
impl ActionHandler for SessionRouter {
    async fn handle(&self, command: Command) -> Result<Value, ActionError> {
        match command {
            Command::Status => self.status(),
            Command::Tabs => self.tabs(),
            Command::Resolve(args) => self.resolve(args).await,
            Command::Replay(args) => self.replay(args).await,
            browser => self.browser_action(browser).await,
        }
    }
}
