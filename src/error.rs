//! Error taxonomy for a verification run.

use std::path::PathBuf;
use thiserror::Error;

use crate::port::PortSpec;

/// Conditions that abort a run before a verdict on the ports can be reached.
///
/// Readiness timeouts and slow shutdowns are deliberately absent: they are
/// recorded in the outcome and the run carries on.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// None of the candidate server binaries exist.
    #[error("server binary not found, searched: {}", display_paths(.searched))]
    BinaryNotFound { searched: Vec<PathBuf> },

    /// A target port was already listening before launch.
    #[error("{port} is already in use")]
    PortInUse { port: PortSpec },

    /// The OS refused to spawn the server.
    #[error("failed to launch {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The server exited inside the settle window.
    #[error("server process died immediately ({status})")]
    LaunchFailure { status: String },

    /// Invalid port number in an override or config value.
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VerifyError {
    /// True for failures detected before anything was started.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            VerifyError::BinaryNotFound { .. } | VerifyError::PortInUse { .. }
        )
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
