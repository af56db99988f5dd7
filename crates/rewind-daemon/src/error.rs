//! Errors raised inside the recorder process.
//!
//! Every enum maps onto [`ErrorKind`] so that a failure inside a handler
//! reaches the client as a tag it can act on.

use std::path::PathBuf;
use std::time::Duration;

use rewind_common::ErrorKind;
use rewind_log::LogError;
use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Failures reported by a browser capability.
#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Browser action '{action}' timed out")]
    Timeout { action: String },
    #[error("Browser action '{action}' failed: {message}")]
    ActionFailed { action: String, message: String },
    #[error("Browser is closed")]
    Closed,
    #[error("Failed to launch browser: {0}")]
    Launch(String),
    #[error("Browser driver sent an invalid message: {0}")]
    Protocol(String),
    #[error("Browser driver I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    pub fn action_failed(action: impl Into<String>, message: impl Into<String>) -> Self {
        BrowserError::ActionFailed {
            action: action.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrowserError::Timeout { .. } => ErrorKind::Timeout,
            BrowserError::ActionFailed { .. } | BrowserError::Closed | BrowserError::Launch(_) => {
                ErrorKind::ActionFailed
            }
            BrowserError::Protocol(_) => ErrorKind::ProtocolError,
            BrowserError::Io(_) => ErrorKind::IoFailure,
        }
    }
}

/// Failures reported by a replay capability.
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Replay was not ready within {0:?}")]
    Timeout(Duration),
    #[error("Replay failed: {0}")]
    Failed(String),
    #[error("Replay produced an invalid result: {0}")]
    Protocol(String),
    #[error("Replay I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplayError::Timeout(_) => ErrorKind::Timeout,
            ReplayError::Failed(_) => ErrorKind::ActionFailed,
            ReplayError::Protocol(_) => ErrorKind::ProtocolError,
            ReplayError::Io(_) => ErrorKind::IoFailure,
        }
    }
}

/// Session start/stop failures.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("A lifecycle operation is already in progress (state: {state})")]
    AlreadyInProgress { state: LifecycleState },
    #[error("No session is active")]
    NotActive,
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("Persistence error during {operation} on '{}': {source}", path.display())]
    Persistence {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode session state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Background task failed: {0}")]
    Task(String),
}

impl LifecycleError {
    pub(crate) fn persistence(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        LifecycleError::Persistence {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::AlreadyInProgress { .. } => ErrorKind::AlreadyInProgress,
            LifecycleError::NotActive => ErrorKind::Unhandled,
            LifecycleError::Log(e) => e.kind(),
            LifecycleError::Browser(e) => e.kind(),
            LifecycleError::Persistence { .. } => ErrorKind::IoFailure,
            LifecycleError::Encode(_) | LifecycleError::Task(_) => ErrorKind::Internal,
        }
    }
}

/// Recorder startup errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to bind socket: {0}")]
    SocketBind(String),
    #[error("Another recorder instance is already running")]
    AlreadyRunning,
    #[error("Failed to acquire lock: {0}")]
    LockFailed(String),
    #[error("Failed to setup signal handler: {0}")]
    SignalSetup(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::SocketBind(_) | DaemonError::LockFailed(_) => ErrorKind::IoFailure,
            DaemonError::AlreadyRunning => ErrorKind::AlreadyInProgress,
            DaemonError::SignalSetup(_) => ErrorKind::Internal,
            DaemonError::Lifecycle(e) => e.kind(),
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            DaemonError::AlreadyRunning => {
                "Stop the running recorder with 'rewind stop' or use 'rewind restart'."
            }
            other => other.kind().suggestion(),
        }
    }
}
