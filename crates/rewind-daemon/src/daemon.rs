//! Recorder process entry point: singleton lock, control server, session
//! start, and the ordered teardown on shutdown.

use std::sync::Arc;

use rewind_ipc::lock_path;
use rewind_ipc::ProcessController;
use rewind_ipc::UnixProcessController;
use tracing::error;
use tracing::info;

use crate::capability::BrowserLauncher;
use crate::capability::ReplayCapability;
use crate::config::RecorderConfig;
use crate::error::DaemonError;
use crate::file_lock::remove_lock_file;
use crate::file_lock::LockFile;
use crate::handler::SessionRouter;
use crate::lifecycle::Lifecycle;
use crate::lifecycle::StartParams;
use crate::lifecycle::StopOutcome;
use crate::lifecycle::TeardownReport;
use crate::server::ControlServer;
use crate::shutdown::ShutdownSignal;
use crate::signal_handler::SignalHandler;

pub struct RecorderDaemon {
    config: RecorderConfig,
    launcher: Arc<dyn BrowserLauncher>,
    replay: Option<Arc<dyn ReplayCapability>>,
    processes: Arc<dyn ProcessController>,
}

impl RecorderDaemon {
    pub fn new(config: RecorderConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            config,
            launcher,
            replay: None,
            processes: Arc::new(UnixProcessController),
        }
    }

    pub fn with_replay(mut self, replay: Arc<dyn ReplayCapability>) -> Self {
        self.replay = Some(replay);
        self
    }

    pub fn with_process_controller(mut self, processes: Arc<dyn ProcessController>) -> Self {
        self.processes = processes;
        self
    }

    /// Runs until SIGINT or SIGTERM.
    pub async fn run(self, params: StartParams) -> Result<TeardownReport, DaemonError> {
        let shutdown = ShutdownSignal::new();
        let _signal_handler = SignalHandler::setup(shutdown.clone())?;
        self.run_until(params, shutdown).await
    }

    /// Runs until `shutdown` is triggered, then tears the session down.
    pub async fn run_until(
        self,
        params: StartParams,
        shutdown: ShutdownSignal,
    ) -> Result<TeardownReport, DaemonError> {
        let socket_path = self.config.socket_path.clone();
        let lock_path = lock_path(&socket_path);
        let _lock = LockFile::acquire(&lock_path)?;

        let server = ControlServer::bind(&socket_path, shutdown.clone())?
            .with_max_request_bytes(self.config.max_request_bytes);
        info!(
            socket = %socket_path.display(),
            pid = std::process::id(),
            "Recorder started"
        );

        let lifecycle = Arc::new(
            Lifecycle::new(self.config, self.launcher, self.processes)
                .with_endpoint(server.endpoint()),
        );
        let mut router = SessionRouter::new(Arc::clone(&lifecycle));
        if let Some(replay) = self.replay {
            router = router.with_replay(replay);
        }
        let server_task = tokio::spawn(server.with_handler(Arc::new(router)).run());

        if let Err(e) = lifecycle.start(params).await {
            error!(error = %e, "Session failed to start, shutting down");
            shutdown.trigger();
            let _ = server_task.await;
            remove_lock_file(&lock_path);
            return Err(e.into());
        }

        shutdown.triggered().await;
        info!("Shutting down recorder...");

        let report = match lifecycle.stop().await {
            StopOutcome::Stopped(report) => report,
            StopOutcome::NoOp(state) => {
                info!(%state, "No session to stop");
                TeardownReport::default()
            }
        };
        if let Err(e) = server_task.await {
            error!(error = %e, "Control server task failed");
        }
        remove_lock_file(&lock_path);
        info!(clean = report.is_clean(), "Recorder stopped");
        Ok(report)
    }
}
