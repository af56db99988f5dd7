use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

pub fn socket_path() -> PathBuf {
    if let Ok(custom_path) = std::env::var("REWIND_SOCKET") {
        return PathBuf::from(custom_path);
    }

    std::env::var("XDG_RUNTIME_DIR")
        .map(|dir| PathBuf::from(dir).join("rewind.sock"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/rewind.sock"))
}

/// `<socket>.lock`, holding the recorder's pid while it runs.
pub fn lock_path(socket: &Path) -> PathBuf {
    let mut name = OsString::from(socket.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// Pid written into the lock file by a running (or crashed) recorder.
pub fn read_recorder_pid(socket: &Path) -> Option<u32> {
    std::fs::read_to_string(lock_path(socket))
        .ok()?
        .trim()
        .parse()
        .ok()
}
