//! Attach errors

use dataplane::DataplaneError;
use ipam::IpamError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from interface, route and tc operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// A command exited unsuccessfully
    #[error("`{cmd}` exited with status {status}: {stderr}")]
    Command {
        /// Command line that was run
        cmd: String,
        /// Exit status, -1 when killed by a signal
        status: i32,
        /// Captured standard error
        stderr: String,
    },

    /// Spawning a command or reading a file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A command printed something we could not understand
    #[error("Unexpected output from `{cmd}`: {reason}")]
    Parse {
        /// Command line that was run
        cmd: String,
        /// What was wrong with it
        reason: String,
    },

    /// The network namespace could not be entered
    #[error("Cannot enter network namespace {}: {reason}", path.display())]
    Namespace {
        /// Namespace handle path
        path: PathBuf,
        /// Failure description
        reason: String,
    },

    /// A link expected to exist is missing
    #[error("Link not found: {0}")]
    LinkNotFound(String),
}

/// Errors returned by the attach orchestrator.
#[derive(Debug, Error)]
pub enum AttachError {
    /// Allocation, release or gateway lookup failed
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Interface plumbing failed
    #[error("Network error: {0}")]
    Net(#[from] NetError),

    /// A dataplane map write failed
    #[error("Dataplane error: {0}")]
    Dataplane(#[from] DataplaneError),

    /// The network configuration or CNI arguments are unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
