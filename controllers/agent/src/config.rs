//! Agent configuration from environment variables.

use crate::error::ControllerError;
use dataplane::DEFAULT_PIN_DIR;
use ipam::DEFAULT_MAX_ATTEMPTS;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default address of the IPAM RPC server.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:50051";
/// Default address of the metrics server.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Settings read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Node this agent runs on (`NODE_NAME`)
    pub node_name: String,
    /// RPC listen address (`LISTEN_ADDR`)
    pub listen_addr: SocketAddr,
    /// Metrics listen address (`METRICS_ADDR`)
    pub metrics_addr: SocketAddr,
    /// Directory of the pinned dataplane maps (`BPF_MAP_DIR`)
    pub bpf_map_dir: PathBuf,
    /// Conditional write attempts per allocation (`ALLOCATE_MAX_ATTEMPTS`)
    pub allocate_max_attempts: usize,
}

impl AgentConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let node_name = lookup("NODE_NAME")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ControllerError::InvalidConfig("NODE_NAME environment variable is required".to_string()))?;

        let addr = |key: &str, default: &str| -> Result<SocketAddr, ControllerError> {
            let raw = lookup(key).unwrap_or_else(|| default.to_string());
            raw.parse()
                .map_err(|_| ControllerError::InvalidConfig(format!("{} is not a socket address: {}", key, raw)))
        };
        let listen_addr = addr("LISTEN_ADDR", DEFAULT_LISTEN_ADDR)?;
        let metrics_addr = addr("METRICS_ADDR", DEFAULT_METRICS_ADDR)?;

        let bpf_map_dir = PathBuf::from(lookup("BPF_MAP_DIR").unwrap_or_else(|| DEFAULT_PIN_DIR.to_string()));

        let allocate_max_attempts = match lookup("ALLOCATE_MAX_ATTEMPTS") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ControllerError::InvalidConfig(format!("ALLOCATE_MAX_ATTEMPTS must be a positive integer: {}", raw))
                })?,
            None => DEFAULT_MAX_ATTEMPTS,
        };

        Ok(Self {
            node_name,
            listen_addr,
            metrics_addr,
            bpf_map_dir,
            allocate_max_attempts,
        })
    }
}
