//! Error taxonomy shared by every rewind crate.
//!
//! Each crate-level error maps onto one of these kinds. The kind travels
//! over the control channel as a snake_case tag so that a client in another
//! process can decide on remediation without parsing messages.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A locator resolved to nothing, or a requested resource is absent.
    NotFound,
    /// A client-side channel wait or a browser/replay wait expired.
    Timeout,
    /// The browser capability rejected or failed an action.
    ActionFailed,
    /// Disk read or write failed.
    IoFailure,
    /// A malformed wire message or stored record.
    ProtocolError,
    /// The control endpoint is absent or refused the connection.
    NotRunning,
    /// A lifecycle operation is already running.
    AlreadyInProgress,
    /// An action named a command outside the closed command set.
    UnknownCommand,
    /// An action arrived but no handler is registered.
    Unhandled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ActionFailed => "action_failed",
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::AlreadyInProgress => "already_in_progress",
            ErrorKind::UnknownCommand => "unknown_command",
            ErrorKind::Unhandled => "unhandled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether the same request may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::AlreadyInProgress)
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => {
                "Check the locator against 'rewind status'; timestamps before the first frame have no state."
            }
            ErrorKind::Timeout => {
                "The recorder may still be busy. Retry, or raise REWIND_REQUEST_TIMEOUT_MS."
            }
            ErrorKind::ActionFailed => "Inspect the page with 'rewind action snapshot_html' and retry.",
            ErrorKind::IoFailure => "Check that REWIND_HOME is writable and the disk is not full.",
            ErrorKind::ProtocolError => "Client and recorder versions may differ. Restart the recorder.",
            ErrorKind::NotRunning => "Start a recorder with 'rewind daemon --url <URL>'.",
            ErrorKind::AlreadyInProgress => "Another start or stop is running. Wait and retry.",
            ErrorKind::UnknownCommand => "Run 'rewind action --help' for the list of tools.",
            ErrorKind::Unhandled => "The recorder has no handler for this request. Restart it with a session.",
            ErrorKind::Internal => "Check the recorder log (REWIND_LOG) for details.",
        }
    }

    /// sysexits-style process exit code for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::ProtocolError | ErrorKind::UnknownCommand => 64, // EX_USAGE
            ErrorKind::NotFound | ErrorKind::NotRunning | ErrorKind::Unhandled => 69, // EX_UNAVAILABLE
            ErrorKind::AlreadyInProgress => 73, // EX_CANTCREAT
            ErrorKind::IoFailure | ErrorKind::ActionFailed | ErrorKind::Internal => 74, // EX_IOERR
            ErrorKind::Timeout => 75, // EX_TEMPFAIL
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_found" => Ok(ErrorKind::NotFound),
            "timeout" => Ok(ErrorKind::Timeout),
            "action_failed" => Ok(ErrorKind::ActionFailed),
            "io_failure" => Ok(ErrorKind::IoFailure),
            "protocol_error" => Ok(ErrorKind::ProtocolError),
            "not_running" => Ok(ErrorKind::NotRunning),
            "already_in_progress" => Ok(ErrorKind::AlreadyInProgress),
            "unknown_command" => Ok(ErrorKind::UnknownCommand),
            "unhandled" => Ok(ErrorKind::Unhandled),
            "internal" => Ok(ErrorKind::Internal),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
