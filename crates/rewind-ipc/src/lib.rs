#![deny(clippy::all)]

mod client;
pub mod command;
mod error;
pub mod process;
mod recorder_lifecycle;
mod socket;
mod types;

pub use client::polling;
pub use client::ClientConfig;
pub use client::ControlClient;
pub use client::RetryPolicy;
pub use client::DEFAULT_REQUEST_TIMEOUT;
pub use command::Command;
pub use command::CommandError;
pub use error::ClientError;
pub use process::terminate_gracefully;
pub use process::ProcessController;
pub use process::ProcessStatus;
pub use process::Signal;
pub use process::Termination;
pub use process::UnixProcessController;
pub use recorder_lifecycle::restart_recorder;
pub use recorder_lifecycle::stop_recorder;
pub use recorder_lifecycle::StopOptions;
pub use recorder_lifecycle::StopResult;
pub use socket::lock_path;
pub use socket::read_recorder_pid;
pub use socket::socket_path;
pub use types::ErrorPayload;
pub use types::Request;
pub use types::RequestKind;
pub use types::Response;
pub use types::PARSE_ERROR_ID;

pub type Result<T> = std::result::Result<T, ClientError>;
