use std::time::Duration;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    NotFound,
    NoPermission,
}

pub trait ProcessController: Send + Sync {
    fn check_process(&self, pid: u32) -> Result<ProcessStatus, std::io::Error>;

    fn send_signal(&self, pid: u32, signal: Signal) -> Result<(), std::io::Error>;
}

/// How a [`terminate_gracefully`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyGone,
    Exited,
    Killed,
}

const LIVENESS_POLL: Duration = Duration::from_millis(20);

/// SIGTERM, poll for exit until `grace` runs out, then SIGKILL.
pub fn terminate_gracefully<P: ProcessController + ?Sized>(
    controller: &P,
    pid: u32,
    grace: Duration,
) -> Result<Termination, std::io::Error> {
    if controller.check_process(pid)? == ProcessStatus::NotFound {
        return Ok(Termination::AlreadyGone);
    }
    controller.send_signal(pid, Signal::Term)?;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if controller.check_process(pid)? == ProcessStatus::NotFound {
            return Ok(Termination::Exited);
        }
        std::thread::sleep(LIVENESS_POLL.min(grace));
    }
    if controller.check_process(pid)? == ProcessStatus::NotFound {
        return Ok(Termination::Exited);
    }
    controller.send_signal(pid, Signal::Kill)?;
    Ok(Termination::Killed)
}

/// Polls until `pid` is gone or `timeout` elapses. Returns whether it is gone.
pub fn wait_for_exit<P: ProcessController + ?Sized>(
    controller: &P,
    pid: u32,
    timeout: Duration,
) -> Result<bool, std::io::Error> {
    let deadline = Instant::now() + timeout;
    loop {
        if controller.check_process(pid)? == ProcessStatus::NotFound {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(LIVENESS_POLL);
    }
}

/// An exited process its parent has not reaped still accepts signal 0.
fn is_zombie(pid: libc::pid_t) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

pub struct UnixProcessController;

impl ProcessController for UnixProcessController {
    fn check_process(&self, pid: u32) -> Result<ProcessStatus, std::io::Error> {
        let pid_t: libc::pid_t = pid.try_into().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "PID out of range")
        })?;

        let result = unsafe { libc::kill(pid_t, 0) };
        if result == 0 {
            if is_zombie(pid_t) {
                return Ok(ProcessStatus::NotFound);
            }
            return Ok(ProcessStatus::Running);
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(ProcessStatus::NotFound),
            Some(libc::EPERM) => Ok(ProcessStatus::NoPermission),
            _ => Err(err),
        }
    }

    fn send_signal(&self, pid: u32, signal: Signal) -> Result<(), std::io::Error> {
        let pid_t: libc::pid_t = pid.try_into().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "PID out of range")
        })?;

        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };

        let result = unsafe { libc::kill(pid_t, sig) };
        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

pub mod mock {
    use super::*;
    use rewind_common::mutex_lock_or_recover;
    use std::collections::HashMap;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Scriptable process table. By default a running process exits on
    /// SIGTERM; [`MockProcessController::ignoring_term`] makes it linger
    /// until SIGKILL and [`MockProcessController::unkillable`] makes it
    /// survive both.
    pub struct MockProcessController {
        process_states: Mutex<HashMap<u32, ProcessStatus>>,
        stubborn: Mutex<HashSet<u32>>,
        unkillable: Mutex<HashSet<u32>>,
        signals_sent: Mutex<Vec<(u32, Signal)>>,
        check_error: Mutex<Option<std::io::Error>>,
        signal_error: Mutex<Option<std::io::Error>>,
    }

    impl Default for MockProcessController {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockProcessController {
        pub fn new() -> Self {
            Self {
                process_states: Mutex::new(HashMap::new()),
                stubborn: Mutex::new(HashSet::new()),
                unkillable: Mutex::new(HashSet::new()),
                signals_sent: Mutex::new(Vec::new()),
                check_error: Mutex::new(None),
                signal_error: Mutex::new(None),
            }
        }

        pub fn with_process(self, pid: u32, status: ProcessStatus) -> Self {
            mutex_lock_or_recover(&self.process_states).insert(pid, status);
            self
        }

        pub fn ignoring_term(self, pid: u32) -> Self {
            mutex_lock_or_recover(&self.stubborn).insert(pid);
            self
        }

        pub fn unkillable(self, pid: u32) -> Self {
            mutex_lock_or_recover(&self.unkillable).insert(pid);
            self
        }

        pub fn with_check_error(self, error: std::io::Error) -> Self {
            *mutex_lock_or_recover(&self.check_error) = Some(error);
            self
        }

        pub fn with_signal_error(self, error: std::io::Error) -> Self {
            *mutex_lock_or_recover(&self.signal_error) = Some(error);
            self
        }

        pub fn signals_sent(&self) -> Vec<(u32, Signal)> {
            mutex_lock_or_recover(&self.signals_sent).clone()
        }
    }

    impl ProcessController for MockProcessController {
        fn check_process(&self, pid: u32) -> Result<ProcessStatus, std::io::Error> {
            if let Some(err) = mutex_lock_or_recover(&self.check_error).take() {
                return Err(err);
            }
            Ok(mutex_lock_or_recover(&self.process_states)
                .get(&pid)
                .copied()
                .unwrap_or(ProcessStatus::NotFound))
        }

        fn send_signal(&self, pid: u32, signal: Signal) -> Result<(), std::io::Error> {
            if let Some(err) = mutex_lock_or_recover(&self.signal_error).take() {
                return Err(err);
            }
            mutex_lock_or_recover(&self.signals_sent).push((pid, signal));
            let exits = !mutex_lock_or_recover(&self.unkillable).contains(&pid)
                && match signal {
                    Signal::Kill => true,
                    Signal::Term => !mutex_lock_or_recover(&self.stubborn).contains(&pid),
                };
            if exits {
                mutex_lock_or_recover(&self.process_states).remove(&pid);
            }
            Ok(())
        }
    }
}
