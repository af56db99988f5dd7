//! Stopping and restarting a recorder from another process.
//!
//! A recorder owns its socket, lock file and session marker until it exits.
//! Nothing here touches those files while the recorder pid is alive: a stop
//! waits out the recorder's own teardown, escalates to SIGKILL, and only
//! clears leftovers once the process is gone.

use std::path::Path;
use std::time::Duration;

use tracing::info;
use tracing::warn;

use crate::error::ClientError;
use crate::process::terminate_gracefully;
use crate::process::wait_for_exit;
use crate::process::ProcessController;
use crate::process::ProcessStatus;
use crate::process::Signal;
use crate::process::Termination;
use crate::socket::lock_path;
use crate::socket::read_recorder_pid;

/// How long a SIGKILLed recorder gets to disappear from the process table.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Time between SIGTERM and SIGKILL. Should cover the recorder's whole
    /// teardown, or a healthy recorder gets killed mid-flush.
    pub grace: Duration,
    /// Skip SIGTERM and kill straight away.
    pub force: bool,
}

impl StopOptions {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            force: false,
        }
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug)]
pub struct StopResult {
    pub pid: u32,
    pub termination: Termination,
    /// Non-fatal cleanup problems.
    pub warnings: Vec<String>,
}

fn signal_failed(pid: u32, e: std::io::Error) -> ClientError {
    ClientError::SignalFailed {
        pid,
        message: e.to_string(),
    }
}

/// Stops the recorder `pid` serving `socket_path`.
///
/// Returns [`ClientError::NotRunning`] when `pid` is already gone (stale
/// endpoint files are cleared), and [`ClientError::StillRunning`] when it
/// survives SIGKILL, in which case its files are left alone.
pub fn stop_recorder<P: ProcessController + ?Sized>(
    controller: &P,
    pid: u32,
    socket_path: &Path,
    options: StopOptions,
) -> Result<StopResult, ClientError> {
    let mut warnings = Vec::new();

    match controller
        .check_process(pid)
        .map_err(|e| signal_failed(pid, e))?
    {
        ProcessStatus::NotFound => {
            release_endpoint_files(socket_path, pid, &mut warnings);
            for warning in &warnings {
                warn!(pid, %warning, "Stale endpoint cleanup incomplete");
            }
            return Err(ClientError::NotRunning {
                path: socket_path.to_path_buf(),
            });
        }
        ProcessStatus::NoPermission => {
            return Err(ClientError::SignalFailed {
                pid,
                message: "Permission denied".to_string(),
            });
        }
        ProcessStatus::Running => {}
    }

    let termination = if options.force {
        controller
            .send_signal(pid, Signal::Kill)
            .map_err(|e| signal_failed(pid, e))?;
        Termination::Killed
    } else {
        info!(pid, grace_ms = options.grace.as_millis() as u64, "Stopping recorder");
        terminate_gracefully(controller, pid, options.grace).map_err(|e| signal_failed(pid, e))?
    };

    if termination == Termination::Killed {
        warn!(pid, "Recorder did not exit on SIGTERM, sent SIGKILL");
        let gone =
            wait_for_exit(controller, pid, KILL_REAP_TIMEOUT).map_err(|e| signal_failed(pid, e))?;
        if !gone {
            return Err(ClientError::StillRunning { pid });
        }
    }

    // A recorder that exited cleanly removed its own files; a killed one
    // leaves them behind.
    release_endpoint_files(socket_path, pid, &mut warnings);
    info!(pid, ?termination, "Recorder stopped");
    Ok(StopResult {
        pid,
        termination,
        warnings,
    })
}

/// Removes the socket and lock file left by `pid`. Files whose lock names a
/// different recorder belong to that recorder and are kept.
fn release_endpoint_files(socket: &Path, pid: u32, warnings: &mut Vec<String>) {
    if let Some(owner) = read_recorder_pid(socket) {
        if owner != pid {
            warnings.push(format!(
                "Endpoint is now held by recorder {}, leaving it in place",
                owner
            ));
            return;
        }
    }
    for (what, path) in [("socket", socket.to_path_buf()), ("lock file", lock_path(socket))] {
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warnings.push(format!("Failed to remove {}: {}", what, e));
            }
        }
    }
}

/// Stop (when a pid is known and alive), settle, then start. A recorder
/// that cannot be stopped aborts the restart before anything is started.
pub fn restart_recorder<P, F, S>(
    controller: &P,
    get_pid: F,
    socket_path: &Path,
    options: StopOptions,
    settle: Duration,
    start_fn: S,
) -> Result<Vec<String>, ClientError>
where
    P: ProcessController + ?Sized,
    F: Fn() -> Option<u32>,
    S: FnOnce() -> Result<(), ClientError>,
{
    let mut all_warnings = Vec::new();

    if let Some(pid) = get_pid() {
        match stop_recorder(controller, pid, socket_path, options) {
            Ok(result) => all_warnings.extend(result.warnings),
            Err(ClientError::NotRunning { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    std::thread::sleep(settle);

    start_fn()?;

    Ok(all_warnings)
}
