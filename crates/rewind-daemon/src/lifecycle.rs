//! Session lifecycle: one active run at a time, explicit state machine,
//! stale-session recovery on start and an ordered, idempotent teardown.

use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;
use std::time::Duration;

use chrono::Utc;
use rewind_common::mutex_lock_or_recover;
use rewind_common::rwlock_read_or_recover;
use rewind_common::rwlock_write_or_recover;
use rewind_ipc::command::WaitPolicy;
use rewind_ipc::polling;
use rewind_ipc::terminate_gracefully;
use rewind_ipc::ProcessController;
use rewind_ipc::Termination;
use rewind_log::Recorder;
use rewind_log::RecorderStats;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::capability::BrowserCapability;
use crate::capability::BrowserLauncher;
use crate::capability::LaunchSpec;
use crate::config::RecorderConfig;
use crate::error::LifecycleError;
use crate::ingest::EventSink;
use crate::ingest::Ingest;
use crate::ingest::IngestStats;
use crate::server::ConnectionTracker;
use crate::session::Marker;
use crate::session::RunInfo;
use crate::session::RunRecord;
use crate::session::StateStore;
use crate::session::TabTable;
use crate::session::Viewport;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Inactive,
    Starting,
    Active,
    Stopping,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Inactive => "inactive",
            LifecycleState::Starting => "starting",
            LifecycleState::Active => "active",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParams {
    pub url: Option<String>,
    #[serde(default)]
    pub viewport: Viewport,
}

/// The control channel as seen by teardown.
#[derive(Clone)]
pub struct ControlEndpoint {
    pub socket_path: PathBuf,
    pub shutdown: ShutdownSignal,
    pub tracker: Arc<ConnectionTracker>,
}

/// Everything owned by the run that is currently recording.
pub struct ActiveSession {
    info: RwLock<RunInfo>,
    dir: PathBuf,
    params: StartParams,
    recorder: Arc<Recorder>,
    tabs: Arc<TabTable>,
    browser: Arc<dyn BrowserCapability>,
    sink: EventSink,
    ingest: tokio::sync::Mutex<Ingest>,
    child_pids: Vec<u32>,
    persist_stop: ShutdownSignal,
    persist_task: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveSession {
    pub fn info(&self) -> RunInfo {
        rwlock_read_or_recover(&self.info).clone()
    }

    pub fn run_id(&self) -> String {
        rwlock_read_or_recover(&self.info).run_id.clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn params(&self) -> &StartParams {
        &self.params
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn tabs(&self) -> &Arc<TabTable> {
        &self.tabs
    }

    pub fn browser(&self) -> Arc<dyn BrowserCapability> {
        Arc::clone(&self.browser)
    }

    pub fn child_pids(&self) -> &[u32] {
        &self.child_pids
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.sink.stats()
    }

    pub fn viewport(&self) -> Viewport {
        rwlock_read_or_recover(&self.info).viewport
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        rwlock_write_or_recover(&self.info).viewport = viewport;
    }

    pub fn run_record(&self, active: bool) -> RunRecord {
        let mut run = self.info();
        run.active = active;
        RunRecord {
            run,
            tabs: self.tabs.list(),
            stats: self.recorder.stats(),
            ingest: self.sink.stats(),
            updated_at: Utc::now(),
        }
    }

    /// Rewrites `run.json`.
    pub fn persist(&self, active: bool) -> Result<(), LifecycleError> {
        self.run_record(active).save(&self.dir)
    }

    fn stop_persisting(&self) {
        self.persist_stop.trigger();
        if let Some(task) = mutex_lock_or_recover(&self.persist_task).take() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Done,
    /// Failed once, then succeeded.
    Retried(String),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownStep {
    pub name: &'static str,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub steps: Vec<TeardownStep>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TeardownStep> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed(_)))
    }

    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.name == name).map(|s| &s.outcome)
    }

    fn skip(&mut self, name: &'static str, reason: &str) {
        debug!(step = name, reason, "Teardown step skipped");
        self.steps.push(TeardownStep {
            name,
            outcome: StepOutcome::Skipped(reason.to_string()),
        });
    }

    /// Runs `step`, retrying once on failure, and records the outcome.
    async fn run<F, Fut>(&mut self, name: &'static str, mut step: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let outcome = match step().await {
            Ok(()) => StepOutcome::Done,
            Err(first) => {
                warn!(step = name, error = %first, "Teardown step failed, retrying");
                match step().await {
                    Ok(()) => StepOutcome::Retried(first),
                    Err(second) => {
                        error!(step = name, error = %second, "Teardown step failed");
                        StepOutcome::Failed(second)
                    }
                }
            }
        };
        debug!(step = name, ?outcome, "Teardown step finished");
        self.steps.push(TeardownStep { name, outcome });
    }
}

#[derive(Debug)]
pub enum StopOutcome {
    /// Nothing to stop, or another stop owns the teardown.
    NoOp(LifecycleState),
    Stopped(TeardownReport),
}

/// What was cleaned up after a previous recorder that left its marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleRecovery {
    pub run_id: String,
    pub terminated: Vec<(u32, Termination)>,
    pub endpoint_released: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownMode {
    Shutdown,
    /// The control channel stays up for the next start.
    Restart,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStatus {
    pub state: LifecycleState,
    pub recorder_pid: u32,
    pub socket_path: PathBuf,
    pub run: Option<RunInfo>,
    pub run_dir: Option<PathBuf>,
    pub stats: Option<RecorderStats>,
    pub ingest: Option<IngestStats>,
    pub tabs: usize,
}

pub struct Lifecycle {
    config: RecorderConfig,
    store: StateStore,
    launcher: Arc<dyn BrowserLauncher>,
    processes: Arc<dyn ProcessController>,
    endpoint: Option<ControlEndpoint>,
    state: Mutex<LifecycleState>,
    current: RwLock<Option<Arc<ActiveSession>>>,
}

impl Lifecycle {
    pub fn new(
        config: RecorderConfig,
        launcher: Arc<dyn BrowserLauncher>,
        processes: Arc<dyn ProcessController>,
    ) -> Self {
        let store = StateStore::new(&config.state_dir);
        Self {
            config,
            store,
            launcher,
            processes,
            endpoint: None,
            state: Mutex::new(LifecycleState::Inactive),
            current: RwLock::new(None),
        }
    }

    pub fn with_endpoint(mut self, endpoint: ControlEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn state(&self) -> LifecycleState {
        *mutex_lock_or_recover(&self.state)
    }

    pub fn current(&self) -> Option<Arc<ActiveSession>> {
        rwlock_read_or_recover(&self.current).clone()
    }

    pub fn status(&self) -> LifecycleStatus {
        let state = self.state();
        let session = self.current();
        LifecycleStatus {
            state,
            recorder_pid: std::process::id(),
            socket_path: self.config.socket_path.clone(),
            run: session.as_ref().map(|s| s.info()),
            run_dir: session.as_ref().map(|s| s.dir().to_path_buf()),
            stats: session.as_ref().map(|s| s.recorder().stats()),
            ingest: session.as_ref().map(|s| s.ingest_stats()),
            tabs: session.as_ref().map(|s| s.tabs().len()).unwrap_or(0),
        }
    }

    /// Moves `from -> to` atomically, or reports the state that blocked it.
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<(), LifecycleState> {
        let mut state = mutex_lock_or_recover(&self.state);
        if *state != from {
            return Err(*state);
        }
        debug!(%from, %to, "Lifecycle transition");
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: LifecycleState) {
        *mutex_lock_or_recover(&self.state) = to;
    }

    pub async fn start(&self, params: StartParams) -> Result<Arc<ActiveSession>, LifecycleError> {
        self.transition(LifecycleState::Inactive, LifecycleState::Starting)
            .map_err(|state| LifecycleError::AlreadyInProgress { state })?;

        match self.start_inner(params).await {
            Ok(session) => {
                *rwlock_write_or_recover(&self.current) = Some(Arc::clone(&session));
                self.set_state(LifecycleState::Active);
                Ok(session)
            }
            Err(e) => {
                error!(error = %e, "Failed to start session");
                self.set_state(LifecycleState::Inactive);
                Err(e)
            }
        }
    }

    async fn start_inner(&self, params: StartParams) -> Result<Arc<ActiveSession>, LifecycleError> {
        if let Some(recovered) = self.recover_stale().await? {
            info!(
                run_id = %recovered.run_id,
                terminated = recovered.terminated.len(),
                endpoint_released = recovered.endpoint_released,
                "Recovered from stale session"
            );
        }

        let mut info = RunInfo::new(params.url.clone(), params.viewport);
        let dir = self.config.run_dir(&info.run_id);
        let policy = self.config.sync_policy;
        let recorder = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || Recorder::open(&dir, policy))
                .await
                .map_err(|e| LifecycleError::Task(e.to_string()))??
        };
        let recorder = Arc::new(recorder);
        let tabs = Arc::new(TabTable::default());
        let mut ingest = Ingest::start(
            Arc::clone(&recorder),
            Arc::clone(&tabs),
            self.config.ingest_capacity,
            self.config.backpressure,
        )?;
        let sink = ingest.sink();

        let spec = LaunchSpec {
            run_id: info.run_id.clone(),
            run_dir: dir.clone(),
            url: params.url.clone(),
            viewport: params.viewport,
        };
        let browser = match self.launcher.launch(&spec, ingest.sink()).await {
            Ok(browser) => browser,
            Err(e) => {
                let _ = ingest.close().await;
                return Err(e.into());
            }
        };
        let child_pids = browser.child_pids();

        let ready = self
            .finish_start(&params, &browser, &child_pids, &info, &dir)
            .await;
        if let Err(e) = ready {
            warn!(error = %e, "Rolling back partially started session");
            let _ = browser.close().await;
            self.terminate_pids(&child_pids).await;
            let _ = ingest.close().await;
            let _ = self.store.clear_marker();
            return Err(e);
        }

        info.active = true;
        let session = Arc::new(ActiveSession {
            info: RwLock::new(info),
            dir,
            params,
            recorder,
            tabs,
            browser,
            sink,
            ingest: tokio::sync::Mutex::new(ingest),
            child_pids,
            persist_stop: ShutdownSignal::new(),
            persist_task: Mutex::new(None),
        });
        session.persist(true)?;
        let task = tokio::spawn(persist_loop(
            Arc::downgrade(&session),
            self.config.persist_interval,
            session.persist_stop.clone(),
        ));
        *mutex_lock_or_recover(&session.persist_task) = Some(task);

        info!(
            run_id = %session.run_id(),
            dir = %session.dir().display(),
            children = session.child_pids().len(),
            "Session active"
        );
        Ok(session)
    }

    async fn finish_start(
        &self,
        params: &StartParams,
        browser: &Arc<dyn BrowserCapability>,
        child_pids: &[u32],
        info: &RunInfo,
        dir: &Path,
    ) -> Result<(), LifecycleError> {
        if let Some(url) = params.url.as_deref() {
            browser.navigate(url, WaitPolicy::Load).await?;
        }
        self.store.save_marker(&Marker {
            run_id: info.run_id.clone(),
            run_dir: dir.to_path_buf(),
            recorder_pid: std::process::id(),
            child_pids: child_pids.to_vec(),
            socket_path: self.config.socket_path.clone(),
        })
    }

    /// Cleans up after a recorder that exited without clearing its marker:
    /// terminates its processes, releases its endpoint, marks its run
    /// inactive and clears the marker. Best-effort past the marker read.
    pub async fn recover_stale(&self) -> Result<Option<StaleRecovery>, LifecycleError> {
        let Some(marker) = self.store.load_marker() else {
            return Ok(None);
        };
        warn!(
            run_id = %marker.run_id,
            pid = marker.recorder_pid,
            "Found marker from a previous session, cleaning up"
        );

        let own_pid = std::process::id();
        let pids: Vec<u32> = std::iter::once(marker.recorder_pid)
            .chain(marker.child_pids.iter().copied())
            .filter(|pid| *pid != own_pid && *pid != 0)
            .collect();
        let terminated = self.terminate_pids(&pids).await;

        let serving_same_socket = self
            .endpoint
            .as_ref()
            .is_some_and(|e| e.socket_path == marker.socket_path);
        let endpoint_released = if serving_same_socket {
            true
        } else {
            release_endpoint(&marker.socket_path, self.config.release_attempts).await
        };
        if !endpoint_released {
            warn!(
                socket = %marker.socket_path.display(),
                "Stale endpoint still present, proceeding anyway"
            );
        }

        match RunRecord::load(&marker.run_dir) {
            Ok(mut record) if record.run.active => {
                record.run.active = false;
                record.updated_at = Utc::now();
                if let Err(e) = record.save(&marker.run_dir) {
                    warn!(error = %e, "Failed to mark stale run inactive");
                }
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "No readable run record for stale session"),
        }

        self.store.clear_marker()?;
        Ok(Some(StaleRecovery {
            run_id: marker.run_id,
            terminated,
            endpoint_released,
        }))
    }

    async fn terminate_pids(&self, pids: &[u32]) -> Vec<(u32, Termination)> {
        if pids.is_empty() {
            return Vec::new();
        }
        let processes = Arc::clone(&self.processes);
        let grace = self.config.kill_grace;
        let pids = pids.to_vec();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut results = Vec::with_capacity(pids.len());
            for pid in pids {
                match terminate_gracefully(processes.as_ref(), pid, grace) {
                    Ok(termination) => {
                        debug!(pid, ?termination, "Terminated process");
                        results.push((pid, termination));
                    }
                    Err(e) => warn!(pid, error = %e, "Failed to terminate process"),
                }
            }
            results
        })
        .await;
        outcome.unwrap_or_else(|e| {
            warn!(error = %e, "Process termination task failed");
            Vec::new()
        })
    }

    /// Stops the active session. Concurrent and repeated calls are no-ops
    /// while a stop is running or after it finished.
    pub async fn stop(&self) -> StopOutcome {
        if let Err(state) = self.transition(LifecycleState::Active, LifecycleState::Stopping) {
            debug!(%state, "Stop requested with no active session");
            return StopOutcome::NoOp(state);
        }
        let report = self.finish_stop(TeardownMode::Shutdown).await;
        StopOutcome::Stopped(report)
    }

    /// Stop, settle, then start again with the same parameters. The
    /// control channel stays up throughout.
    pub async fn restart(&self) -> Result<(TeardownReport, Arc<ActiveSession>), LifecycleError> {
        let params = self
            .current()
            .map(|s| s.params().clone())
            .ok_or(LifecycleError::NotActive)?;
        self.transition(LifecycleState::Active, LifecycleState::Stopping)
            .map_err(|state| LifecycleError::AlreadyInProgress { state })?;
        let report = self.finish_stop(TeardownMode::Restart).await;
        tokio::time::sleep(self.config.restart_settle).await;
        let session = self.start(params).await?;
        Ok((report, session))
    }

    async fn finish_stop(&self, mode: TeardownMode) -> TeardownReport {
        let session = rwlock_write_or_recover(&self.current).take();
        let report = match session {
            Some(session) => self.teardown(&session, mode).await,
            None => TeardownReport::default(),
        };
        self.set_state(LifecycleState::Inactive);
        if report.is_clean() {
            info!(steps = report.steps.len(), "Session stopped");
        } else {
            warn!(
                failed = report.failures().count(),
                "Session stopped with teardown failures"
            );
        }
        report
    }

    async fn teardown(&self, session: &ActiveSession, mode: TeardownMode) -> TeardownReport {
        let mut report = TeardownReport::default();
        let endpoint = match mode {
            TeardownMode::Shutdown => self.endpoint.as_ref(),
            TeardownMode::Restart => None,
        };
        let no_endpoint = match mode {
            TeardownMode::Shutdown => "no control endpoint",
            TeardownMode::Restart => "control channel kept for restart",
        };

        match endpoint {
            Some(ep) => {
                report
                    .run("stop_accepting", || async move {
                        ep.shutdown.trigger();
                        Ok(())
                    })
                    .await
            }
            None => report.skip("stop_accepting", no_endpoint),
        }

        match endpoint {
            Some(ep) => {
                let timeout = self.config.drain_timeout;
                report
                    .run("drain_requests", || async move {
                        if ep.tracker.wait_idle(timeout).await {
                            Ok(())
                        } else {
                            Err(format!(
                                "{} requests still in flight after {:?}",
                                ep.tracker.in_flight(),
                                timeout
                            ))
                        }
                    })
                    .await
            }
            None => report.skip("drain_requests", no_endpoint),
        }

        let browser = session.browser();
        let browser = &browser;
        report
            .run("close_browser", || async move {
                browser.close().await.map_err(|e| e.to_string())
            })
            .await;

        let children = session.child_pids();
        if children.is_empty() {
            report.skip("terminate_children", "no tracked child processes");
        } else {
            report
                .run("terminate_children", || async move {
                    let done = self.terminate_pids(children).await;
                    if done.len() == children.len() {
                        Ok(())
                    } else {
                        Err(format!(
                            "{} of {} child processes could not be signalled",
                            children.len() - done.len(),
                            children.len()
                        ))
                    }
                })
                .await;
        }

        report
            .run("close_ingest", || async move {
                session
                    .ingest
                    .lock()
                    .await
                    .close()
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            })
            .await;

        session.stop_persisting();
        report
            .run("persist_run", || async move {
                session.persist(false).map_err(|e| e.to_string())
            })
            .await;

        match endpoint {
            Some(ep) => {
                report
                    .run("remove_endpoint", || async move {
                        remove_if_present(&ep.socket_path)
                    })
                    .await
            }
            None => report.skip("remove_endpoint", no_endpoint),
        }

        let store = &self.store;
        report
            .run("clear_marker", || async move {
                store.clear_marker().map(|_| ()).map_err(|e| e.to_string())
            })
            .await;

        report
    }
}

async fn persist_loop(session: Weak<ActiveSession>, interval: Duration, stop: ShutdownSignal) {
    // interval() rejects a zero period.
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; start() already persisted.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.triggered() => break,
            _ = ticker.tick() => {
                let Some(session) = session.upgrade() else { break };
                if let Err(e) = session.persist(true) {
                    warn!(error = %e, "Periodic run persistence failed");
                }
            }
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), String> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("failed to remove '{}': {}", path.display(), e)),
    }
}

/// Waits, with backoff, until nothing accepts connections at `socket`, then
/// removes the file. Returns false when a listener is still there after
/// `attempts` polls; the file is then left to whoever serves it.
async fn release_endpoint(socket: &Path, attempts: u32) -> bool {
    let mut delay = polling::INITIAL_POLL_INTERVAL;
    for attempt in 0..=attempts {
        match UnixStream::connect(socket).await {
            Ok(_) => debug!(socket = %socket.display(), attempt, "Stale endpoint still accepting"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(_) => {
                return match remove_if_present(socket) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "Failed to remove stale endpoint");
                        false
                    }
                };
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(polling::MAX_POLL_INTERVAL);
        }
    }
    false
}
