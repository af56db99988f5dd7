#![deny(clippy::all)]

pub mod adapters;
mod capability;
mod config;
mod daemon;
mod error;
mod file_lock;
mod handler;
mod ingest;
mod lifecycle;
mod server;
mod session;
mod shutdown;
mod signal_handler;
pub mod test_support;

pub use capability::BrowserCapability;
pub use capability::BrowserLauncher;
pub use capability::LaunchSpec;
pub use capability::ReplayArtifact;
pub use capability::ReplayCapability;
pub use capability::ReplayJob;
pub use config::default_state_dir;
pub use config::RecorderConfig;
pub use daemon::RecorderDaemon;
pub use error::BrowserError;
pub use error::DaemonError;
pub use error::LifecycleError;
pub use error::ReplayError;
pub use file_lock::LockFile;
pub use handler::ActionError;
pub use handler::ActionHandler;
pub use handler::SessionRouter;
pub use ingest::Backpressure;
pub use ingest::Emitted;
pub use ingest::EventSink;
pub use ingest::Ingest;
pub use ingest::IngestError;
pub use ingest::IngestStats;
pub use lifecycle::ActiveSession;
pub use lifecycle::ControlEndpoint;
pub use lifecycle::Lifecycle;
pub use lifecycle::LifecycleState;
pub use lifecycle::LifecycleStatus;
pub use lifecycle::StaleRecovery;
pub use lifecycle::StartParams;
pub use lifecycle::StepOutcome;
pub use lifecycle::StopOutcome;
pub use lifecycle::TeardownReport;
pub use lifecycle::TeardownStep;
pub use server::ConnectionTracker;
pub use server::ControlServer;
pub use server::TrackerGuard;
pub use server::DEFAULT_MAX_REQUEST_BYTES;
pub use session::Marker;
pub use session::RunInfo;
pub use session::RunRecord;
pub use session::StateStore;
pub use session::TabInfo;
pub use session::TabTable;
pub use session::Viewport;
pub use shutdown::ShutdownSignal;
