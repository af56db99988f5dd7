//! Seams to the external collaborators: the browser engine and the replay
//! renderer. The recorder drives both through these traits and never links
//! either directly.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rewind_ipc::command::ElementState;
use rewind_ipc::command::ReplayOutput;
use rewind_ipc::command::WaitPolicy;
use rewind_log::EventRecord;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::BrowserError;
use crate::error::ReplayError;
use crate::ingest::EventSink;
use crate::session::Viewport;

#[async_trait]
pub trait BrowserCapability: Send + Sync {
    async fn navigate(&self, url: &str, wait: WaitPolicy) -> Result<(), BrowserError>;

    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), BrowserError>;

    async fn hover(&self, selector: &str) -> Result<(), BrowserError>;

    /// Returns the values that ended up selected.
    async fn select(&self, selector: &str, values: &[String]) -> Result<Vec<String>, BrowserError>;

    async fn upload(&self, selector: &str, files: &[PathBuf]) -> Result<(), BrowserError>;

    async fn evaluate(&self, expression: &str, args: &[Value]) -> Result<Value, BrowserError>;

    async fn wait_for(
        &self,
        selector: &str,
        state: ElementState,
        timeout: Option<Duration>,
    ) -> Result<(), BrowserError>;

    async fn resize(&self, viewport: Viewport) -> Result<(), BrowserError>;

    async fn screenshot(&self, path: &Path, full_page: bool) -> Result<(), BrowserError>;

    async fn snapshot_html(&self) -> Result<String, BrowserError>;

    /// Must be safe to call more than once.
    async fn close(&self) -> Result<(), BrowserError>;

    /// Processes the capability started and the recorder must reap on stop.
    fn child_pids(&self) -> Vec<u32> {
        Vec::new()
    }
}

/// What a launcher needs to bring up a browser for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub url: Option<String>,
    pub viewport: Viewport,
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Starts a browser whose captured events flow into `sink`.
    async fn launch(
        &self,
        spec: &LaunchSpec,
        sink: EventSink,
    ) -> Result<Arc<dyn BrowserCapability>, BrowserError>;
}

/// One replay request: the ordered event prefix of a tab and how to
/// render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayJob {
    pub events: Vec<EventRecord>,
    pub viewport: Viewport,
    pub output: ReplayOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayArtifact {
    Html { html: String },
    Image { path: PathBuf },
}

#[async_trait]
pub trait ReplayCapability: Send + Sync {
    /// Renders `job`. Callers bound the wait; implementations may assume
    /// the future is dropped on expiry.
    async fn render(&self, job: ReplayJob) -> Result<ReplayArtifact, ReplayError>;
}
