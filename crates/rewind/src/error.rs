//! Errors surfaced by the binary, each carrying the taxonomy kind that
//! decides its exit code and suggestion.

use std::path::PathBuf;

use rewind_common::ErrorKind;
use rewind_daemon::DaemonError;
use rewind_ipc::ClientError;
use rewind_ipc::CommandError;
use rewind_log::LogError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Action arguments are not valid JSON: {0}")]
    Args(#[from] serde_json::Error),

    #[error("No browser driver configured")]
    NoBrowser,

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("No event log in '{}'", dir.display())]
    NoRun { dir: PathBuf },

    #[error("Frame index of '{}' does not match its event log", dir.display())]
    IndexMismatch { dir: PathBuf },
}

impl CliError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CliError::Client(e) => e.kind(),
            CliError::Daemon(e) => e.kind(),
            CliError::Log(e) => e.kind(),
            CliError::Command(e) => e.kind(),
            CliError::Args(_) | CliError::IndexMismatch { .. } => ErrorKind::ProtocolError,
            CliError::NoBrowser => ErrorKind::Unhandled,
            CliError::NoRun { .. } => ErrorKind::NotFound,
            CliError::Runtime(_) => ErrorKind::Internal,
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            CliError::Daemon(e) => e.suggestion(),
            CliError::Client(ClientError::StillRunning { .. }) => {
                "The recorder did not exit. Check it with 'ps' before starting another."
            }
            CliError::Args(_) => "Quote the arguments as one JSON object, e.g. '{\"selector\":\"#go\"}'.",
            CliError::NoBrowser => "Set REWIND_BROWSER_CMD to a browser driver program.",
            CliError::NoRun { .. } => "Pass a run directory, e.g. one listed under $REWIND_HOME/runs.",
            CliError::IndexMismatch { .. } => "Run 'rewind reindex <dir>' without --verify to rebuild it.",
            other => other.kind().suggestion(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}
