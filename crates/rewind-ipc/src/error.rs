use std::path::PathBuf;
use std::time::Duration;

use rewind_common::ErrorKind;
use thiserror::Error;

use crate::types::ErrorPayload;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Recorder not running (no endpoint at '{}')", path.display())]
    NotRunning { path: PathBuf },

    #[error("Failed to connect to recorder at '{}': {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Control channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("No reply to request {id} within {}ms", after.as_millis())]
    Timeout { id: String, after: Duration },

    #[error("Connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("Invalid response from recorder: {0}")]
    InvalidResponse(String),

    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("Failed to signal process {pid}: {message}")]
    SignalFailed { pid: u32, message: String },

    #[error("Recorder {pid} is still running after SIGKILL")]
    StillRunning { pid: u32 },
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::NotRunning { .. } => ErrorKind::NotRunning,
            ClientError::Connect { .. } | ClientError::Io(_) | ClientError::ConnectionClosed => {
                ErrorKind::IoFailure
            }
            ClientError::Encode(_) => ErrorKind::Internal,
            ClientError::Timeout { .. } => ErrorKind::Timeout,
            ClientError::InvalidResponse(_) => ErrorKind::ProtocolError,
            ClientError::Remote { kind, .. } => *kind,
            ClientError::SignalFailed { .. } => ErrorKind::ActionFailed,
            ClientError::StillRunning { .. } => ErrorKind::Timeout,
        }
    }

    /// Absent or refusing endpoints mean "not running"; anything else is a
    /// genuine I/O failure.
    pub(crate) fn from_connect(path: PathBuf, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ClientError::NotRunning { path }
            }
            _ => ClientError::Connect { path, source },
        }
    }
}

impl From<ErrorPayload> for ClientError {
    fn from(payload: ErrorPayload) -> Self {
        ClientError::Remote {
            kind: payload.kind,
            message: payload.message,
        }
    }
}
