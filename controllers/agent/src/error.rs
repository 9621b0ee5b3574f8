//! Agent error types.

use dataplane::DataplaneError;
use ipam::IpamError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the podnet agent.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// IPAM error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Dataplane maps could not be loaded or written
    #[error("Dataplane error: {0}")]
    Dataplane(#[from] DataplaneError),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Listener or socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// An HTTP server stopped
    #[error("Server failed: {0}")]
    Server(String),
}
