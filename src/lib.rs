//! Black-box network-readiness verifier.
//!
//! Launches a server binary, waits for it to bind its TCP and UDP ports,
//! pokes both, shuts it down and checks the ports are released again.

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod cli;
pub mod config_source;
pub mod error;
pub mod orchestrator;
pub mod port;
pub mod port_checker;
pub mod port_waiter;
pub mod probe;
pub mod process_manager;
pub mod reporter;
pub mod signals;

pub use config_source::ConfigSource;
pub use error::VerifyError;
pub use orchestrator::{Stage, TestOutcome, TestSession, Verdict};
pub use port::{PortSpec, Protocol};
pub use port_checker::{Detection, DetectionSource, ListenState, PortChecker};
pub use port_waiter::PortWaiter;
pub use process_manager::{ProcessConfig, ProcessHandle, ProcessLifecycle};
pub use reporter::{ConsoleReporter, Level, RecordingReporter, Reporter};
