use std::path::Path;
use std::path::PathBuf;

use rewind_common::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("I/O error during {operation} on '{}': {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Event payload has no numeric 'timestamp' field")]
    MissingTimestamp,

    #[error("No frame matches {0}")]
    NotFound(String),

    #[error("Invalid locator '{input}': {reason}")]
    InvalidLocator { input: String, reason: String },
}

impl LogError {
    pub(crate) fn io(operation: &'static str, path: &Path, source: std::io::Error) -> Self {
        LogError::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn invalid_locator(input: &str, reason: impl Into<String>) -> Self {
        LogError::InvalidLocator {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LogError::Io { .. } => ErrorKind::IoFailure,
            LogError::Encode(_) => ErrorKind::Internal,
            LogError::MissingTimestamp | LogError::InvalidLocator { .. } => {
                ErrorKind::ProtocolError
            }
            LogError::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display_includes_operation_and_path() {
        let err = LogError::io(
            "append",
            Path::new("/tmp/run/events.jsonl"),
            std::io::Error::other("disk full"),
        );
        let text = err.to_string();
        assert!(text.contains("append"));
        assert!(text.contains("/tmp/run/events.jsonl"));
        assert!(text.contains("disk full"));
        assert_eq!(err.kind(), ErrorKind::IoFailure);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(LogError::MissingTimestamp.kind(), ErrorKind::ProtocolError);
        assert_eq!(
            LogError::NotFound("@900".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            LogError::invalid_locator("x#y", "bad ordinal").kind(),
            ErrorKind::ProtocolError
        );
    }
}
