use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::split_command;
use crate::capability::ReplayArtifact;
use crate::capability::ReplayCapability;
use crate::capability::ReplayJob;
use crate::config::RecorderConfig;
use crate::error::ReplayError;

/// Runs the replay command once per job: the job as JSON on stdin, one
/// [`ReplayArtifact`] as JSON on stdout.
pub struct CommandReplay {
    command: String,
}

impl CommandReplay {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn from_config(config: &RecorderConfig) -> Option<Self> {
        config.replay_cmd.as_deref().map(Self::new)
    }
}

#[async_trait]
impl ReplayCapability for CommandReplay {
    async fn render(&self, job: ReplayJob) -> Result<ReplayArtifact, ReplayError> {
        let (program, args) = split_command(&self.command)
            .ok_or_else(|| ReplayError::Failed("replay command is empty".to_string()))?;
        let input = serde_json::to_vec(&job)
            .map_err(|e| ReplayError::Protocol(format!("failed to encode job: {}", e)))?;

        // Dropping the future on timeout kills the child.
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ReplayError::Failed("replay stdin is not piped".to_string()))?;

        let write_job = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        };
        let (written, output) = tokio::join!(write_job, child.wait_with_output());
        let output = output?;
        if let Err(e) = written {
            debug!(error = %e, "Replay command did not read the whole job");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReplayError::Failed(format!(
                "'{}' exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| ReplayError::Protocol(format!("invalid replay output: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Viewport;
    use rewind_ipc::command::ReplayOutput;
    use rewind_log::EventPayload;
    use rewind_log::EventRecord;
    use rewind_log::TabId;
    use serde_json::json;
    use tempfile::TempDir;

    fn job() -> ReplayJob {
        ReplayJob {
            events: vec![EventRecord::new(
                TabId(0),
                EventPayload::new(json!({"type": 2, "timestamp": 1000})),
            )],
            viewport: Viewport::default(),
            output: ReplayOutput::Html,
            path: None,
        }
    }

    fn script(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("replay.sh");
        std::fs::write(&path, body).unwrap();
        format!("sh {}", path.display())
    }

    #[tokio::test]
    async fn test_command_replay_parses_artifact() {
        let dir = TempDir::new().unwrap();
        let command = script(
            &dir,
            "cat > /dev/null\nprintf '%s\\n' '{\"kind\":\"html\",\"html\":\"<p>replayed</p>\"}'\n",
        );
        let artifact = CommandReplay::new(command).render(job()).await.unwrap();
        assert_eq!(
            artifact,
            ReplayArtifact::Html {
                html: "<p>replayed</p>".into()
            }
        );
    }

    #[tokio::test]
    async fn test_command_replay_failure_exit() {
        let dir = TempDir::new().unwrap();
        let command = script(&dir, "cat > /dev/null\necho boom >&2\nexit 3\n");
        let err = CommandReplay::new(command).render(job()).await.unwrap_err();
        assert!(matches!(err, ReplayError::Failed(ref m) if m.contains("boom")));
    }

    #[tokio::test]
    async fn test_command_replay_garbage_output() {
        let dir = TempDir::new().unwrap();
        let command = script(&dir, "cat > /dev/null\necho not-json\n");
        let err = CommandReplay::new(command).render(job()).await.unwrap_err();
        assert!(matches!(err, ReplayError::Protocol(_)));
    }
}
