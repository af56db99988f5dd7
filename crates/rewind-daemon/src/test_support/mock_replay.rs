use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rewind_common::mutex_lock_or_recover;
use rewind_ipc::command::ReplayOutput;

use crate::capability::ReplayArtifact;
use crate::capability::ReplayCapability;
use crate::capability::ReplayJob;
use crate::error::ReplayError;

/// Renders a description of the job instead of a page, and keeps every
/// job it was given.
#[derive(Default)]
pub struct MockReplay {
    jobs: Mutex<Vec<ReplayJob>>,
    delay: Option<Duration>,
    failure: Option<String>,
}

impl MockReplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn jobs(&self) -> Vec<ReplayJob> {
        mutex_lock_or_recover(&self.jobs).clone()
    }
}

#[async_trait]
impl ReplayCapability for MockReplay {
    async fn render(&self, job: ReplayJob) -> Result<ReplayArtifact, ReplayError> {
        mutex_lock_or_recover(&self.jobs).push(job.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(ReplayError::Failed(message.clone()));
        }
        let artifact = match job.output {
            ReplayOutput::Html => ReplayArtifact::Html {
                html: format!("<replay events=\"{}\"></replay>", job.events.len()),
            },
            ReplayOutput::Image => ReplayArtifact::Image {
                path: job
                    .path
                    .unwrap_or_else(|| PathBuf::from("replay.png")),
            },
        };
        Ok(artifact)
    }
}
