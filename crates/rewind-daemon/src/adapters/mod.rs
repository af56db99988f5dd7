//! Capabilities backed by external programs, configured through
//! `REWIND_BROWSER_CMD` and `REWIND_REPLAY_CMD`.

mod command_replay;
mod stdio_browser;

pub use command_replay::CommandReplay;
pub use stdio_browser::StdioBrowser;
pub use stdio_browser::StdioLauncher;

/// Splits a configured command line on whitespace. No shell quoting.
pub fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}
