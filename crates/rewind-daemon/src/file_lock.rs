//! Recorder singleton enforcement through `flock(2)` on `<socket>.lock`.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::DaemonError;

/// A held lock file that releases on drop.
pub struct LockFile {
    #[allow(dead_code)]
    file: File,
}

impl LockFile {
    /// Takes an exclusive, non-blocking lock on `lock_path` and records
    /// this process id in it.
    ///
    /// Returns `DaemonError::AlreadyRunning` if another live process holds
    /// the lock. A lock file left by a dead process is simply re-locked.
    pub fn acquire(lock_path: &Path) -> Result<Self, DaemonError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DaemonError::LockFailed(format!("failed to create '{}': {}", parent.display(), e))
            })?;
        }
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| DaemonError::LockFailed(format!("failed to open lock file: {}", e)))?;

        let fd = lock_file.as_raw_fd();

        // SAFETY: flock is safe to call with a valid file descriptor
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => {
                    Err(DaemonError::AlreadyRunning)
                }
                _ => Err(DaemonError::LockFailed(format!("flock failed: {}", err))),
            };
        }

        lock_file
            .set_len(0)
            .map_err(|e| DaemonError::LockFailed(format!("failed to truncate lock file: {}", e)))?;

        let mut lock_file = lock_file;
        writeln!(lock_file, "{}", std::process::id())
            .map_err(|e| DaemonError::LockFailed(format!("failed to write PID: {}", e)))?;

        Ok(Self { file: lock_file })
    }
}

pub fn remove_lock_file(lock_path: &Path) {
    if lock_path.exists() {
        let _ = std::fs::remove_file(lock_path);
    }
}
