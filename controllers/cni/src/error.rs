//! Plugin error types.

use attach::{AttachError, CniError};
use thiserror::Error;

/// Errors that can occur in the CNI plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The attach or detach sequence failed
    #[error(transparent)]
    Attach(#[from] AttachError),

    /// A required `CNI_*` variable is missing
    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),

    /// The agent client could not be built
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Reading the configuration or writing the result failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The result could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// Error reported to the runtime.
    pub fn to_cni(&self, cni_version: &str) -> CniError {
        match self {
            PluginError::Attach(e) => CniError::from_attach(cni_version, e),
            PluginError::MissingEnv(_) => CniError {
                cni_version: cni_version.to_string(),
                code: attach::cni::ERR_INVALID_CONFIG,
                msg: self.to_string(),
                details: String::new(),
            },
            _ => CniError {
                cni_version: cni_version.to_string(),
                code: attach::cni::ERR_PLUGIN,
                msg: self.to_string(),
                details: String::new(),
            },
        }
    }
}
