use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rewind_log::SyncPolicy;

use crate::ingest::Backpressure;

const DEFAULT_INGEST_CAPACITY: usize = 4096;
const DEFAULT_MAX_REQUEST_BYTES: usize = 1_048_576; // 1MB
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_KILL_GRACE_MS: u64 = 2_000;
const DEFAULT_RELEASE_ATTEMPTS: u32 = 10;
const DEFAULT_RESTART_SETTLE_MS: u64 = 500;
const DEFAULT_PERSIST_INTERVAL_MS: u64 = 5_000;
const DEFAULT_REPLAY_TIMEOUT_MS: u64 = 30_000;
/// Teardown work past the drain and kill waits: browser close, ingest
/// flush, run persistence.
const TEARDOWN_SLACK: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Holds `current.json` and `runs/<run-id>/`.
    pub state_dir: PathBuf,
    pub socket_path: PathBuf,
    pub sync_policy: SyncPolicy,
    pub ingest_capacity: usize,
    pub backpressure: Backpressure,
    pub max_request_bytes: usize,
    pub drain_timeout: Duration,
    pub kill_grace: Duration,
    /// Polls of a stale endpoint before startup gives up waiting for it.
    pub release_attempts: u32,
    pub restart_settle: Duration,
    pub persist_interval: Duration,
    pub replay_timeout: Duration,
    pub browser_cmd: Option<String>,
    pub replay_cmd: Option<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(name).unwrap_or(default))
}

fn env_command(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn default_state_dir() -> PathBuf {
    if let Ok(home) = env::var("REWIND_HOME") {
        return PathBuf::from(home);
    }
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".rewind")
}

impl RecorderConfig {
    pub fn from_env() -> Self {
        Self {
            state_dir: default_state_dir(),
            socket_path: rewind_ipc::socket_path(),
            sync_policy: env_parse("REWIND_LOG_SYNC").unwrap_or_default(),
            ingest_capacity: env_parse::<usize>("REWIND_INGEST_CAPACITY")
                .filter(|c| *c > 0)
                .unwrap_or(DEFAULT_INGEST_CAPACITY),
            backpressure: env_parse("REWIND_BACKPRESSURE").unwrap_or_default(),
            max_request_bytes: env_parse("REWIND_MAX_REQUEST").unwrap_or(DEFAULT_MAX_REQUEST_BYTES),
            drain_timeout: env_millis("REWIND_DRAIN_TIMEOUT_MS", DEFAULT_DRAIN_TIMEOUT_MS),
            kill_grace: env_millis("REWIND_KILL_GRACE_MS", DEFAULT_KILL_GRACE_MS),
            release_attempts: env_parse("REWIND_RELEASE_ATTEMPTS")
                .unwrap_or(DEFAULT_RELEASE_ATTEMPTS),
            restart_settle: env_millis("REWIND_RESTART_SETTLE_MS", DEFAULT_RESTART_SETTLE_MS),
            persist_interval: env_millis("REWIND_PERSIST_INTERVAL_MS", DEFAULT_PERSIST_INTERVAL_MS),
            replay_timeout: env_millis("REWIND_REPLAY_TIMEOUT_MS", DEFAULT_REPLAY_TIMEOUT_MS),
            browser_cmd: env_command("REWIND_BROWSER_CMD"),
            replay_cmd: env_command("REWIND_REPLAY_CMD"),
        }
    }

    /// Upper bound on a recorder's own teardown. Drain and child termination
    /// each run at most twice (one retry). Another process stopping this
    /// recorder waits this long before SIGKILL.
    pub fn teardown_budget(&self) -> Duration {
        (self.drain_timeout + self.kill_grace) * 2 + TEARDOWN_SLACK
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    pub fn with_ingest_capacity(mut self, capacity: usize) -> Self {
        self.ingest_capacity = capacity.max(1);
        self
    }

    pub fn with_backpressure(mut self, policy: Backpressure) -> Self {
        self.backpressure = policy;
        self
    }

    pub fn with_max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_release_attempts(mut self, attempts: u32) -> Self {
        self.release_attempts = attempts;
        self
    }

    pub fn with_restart_settle(mut self, settle: Duration) -> Self {
        self.restart_settle = settle;
        self
    }

    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    pub fn with_replay_timeout(mut self, timeout: Duration) -> Self {
        self.replay_timeout = timeout;
        self
    }

    pub fn with_browser_cmd(mut self, cmd: Option<String>) -> Self {
        self.browser_cmd = cmd;
        self
    }

    pub fn with_replay_cmd(mut self, cmd: Option<String>) -> Self {
        self.replay_cmd = cmd;
        self
    }
}
