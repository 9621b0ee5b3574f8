//! CNI wire types: network configuration, runtime arguments, results and
//! errors.

use crate::error::AttachError;
use dataplane::{DEFAULT_PIN_DIR, MacAddr};
use ipam::IpamError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

/// CNI versions this plugin can speak.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Invalid network configuration or arguments.
pub const ERR_INVALID_CONFIG: u32 = 7;
/// Transient failure; the runtime should retry later.
pub const ERR_TRY_AGAIN: u32 = 11;
/// Any other plugin failure.
pub const ERR_PLUGIN: u32 = 100;

fn default_mtu() -> u32 {
    1450
}

fn default_agent_url() -> String {
    "http://127.0.0.1:50051".to_string()
}

fn default_program_dir() -> PathBuf {
    PathBuf::from("/opt/podnet")
}

fn default_bpf_map_dir() -> PathBuf {
    PathBuf::from(DEFAULT_PIN_DIR)
}

fn default_tunnel_name() -> String {
    "podnet-vxlan".to_string()
}

fn default_timeout_seconds() -> u64 {
    5
}

/// Network configuration passed on stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// CNI version the runtime expects in the result
    pub cni_version: String,
    /// Network name
    #[serde(default)]
    pub name: String,
    /// Plugin type
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// MTU of the pod interface pair
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// Gateway override, `a.b.c.d` or `a.b.c.d/nn`
    #[serde(default)]
    pub gateway: Option<String>,
    /// Node name used for the gateway lookup
    #[serde(default)]
    pub node_name: Option<String>,
    /// Base URL of the node agent
    #[serde(default = "default_agent_url")]
    pub agent_url: String,
    /// Directory holding the tc object files
    #[serde(default = "default_program_dir")]
    pub program_dir: PathBuf,
    /// Directory the dataplane maps are pinned in
    #[serde(default = "default_bpf_map_dir")]
    pub bpf_map_dir: PathBuf,
    /// Overlay tunnel device name
    #[serde(default = "default_tunnel_name")]
    pub tunnel_name: String,
    /// Timeout of each agent call
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl NetConf {
    /// Parses the configuration blob read from stdin.
    pub fn parse(bytes: &[u8]) -> Result<Self, AttachError> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| AttachError::InvalidConfig(format!("cannot parse network configuration: {}", e)))?;
        if conf.mtu < 576 {
            return Err(AttachError::InvalidConfig(format!("mtu {} is too small", conf.mtu)));
        }
        Ok(conf)
    }

    /// Gateway override, if one is configured.
    pub fn gateway_override(&self) -> Result<Option<Ipv4Addr>, AttachError> {
        let Some(raw) = self.gateway.as_deref().map(str::trim).filter(|g| !g.is_empty()) else {
            return Ok(None);
        };
        let addr = raw.split_once('/').map_or(raw, |(addr, _)| addr);
        addr.parse::<Ipv4Addr>()
            .map(Some)
            .map_err(|_| AttachError::InvalidConfig(format!("invalid gateway {}", raw)))
    }
}

/// Pod identity carried in `CNI_ARGS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodArgs {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod UID, empty if the runtime did not pass it
    pub uid: String,
}

impl PodArgs {
    /// Parses `K=V;K=V` runtime arguments.
    ///
    /// Reads `K8S_POD_NAMESPACE`, `K8S_POD_NAME` and `K8S_POD_UID`, also
    /// accepting the `POD_*` spellings. Unknown keys are ignored.
    pub fn parse(args: &str) -> Result<Self, AttachError> {
        let mut namespace = None;
        let mut name = None;
        let mut uid = None;
        for pair in args.split(';').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(AttachError::InvalidConfig(format!("malformed CNI_ARGS entry {}", pair)));
            };
            let value = value.to_string();
            match key.trim_start_matches("K8S_") {
                "POD_NAMESPACE" => namespace = Some(value),
                "POD_NAME" => name = Some(value),
                "POD_UID" => uid = Some(value),
                _ => {}
            }
        }
        let namespace = namespace
            .filter(|n| !n.is_empty())
            .ok_or_else(|| AttachError::InvalidConfig("CNI_ARGS is missing the pod namespace".to_string()))?;
        let name = name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| AttachError::InvalidConfig("CNI_ARGS is missing the pod name".to_string()))?;
        Ok(Self {
            namespace,
            name,
            uid: uid.unwrap_or_default(),
        })
    }
}

/// `CNI_COMMAND` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Attach a container
    Add,
    /// Detach a container
    Del,
    /// Validate an attachment
    Check,
    /// Report supported versions
    Version,
}

impl FromStr for Command {
    type Err = AttachError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(AttachError::InvalidConfig(format!("unknown CNI_COMMAND {}", other))),
        }
    }
}

/// Interface entry of a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CniInterface {
    /// Interface name
    pub name: String,
    /// Hardware address
    pub mac: String,
    /// Namespace path, set for interfaces inside the container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// Address entry of a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CniIp {
    /// `"4"`, only present for pre-1.0 results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Address in CIDR form
    pub address: String,
    /// Gateway address
    pub gateway: String,
    /// Index into `interfaces`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// Route entry of a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CniRoute {
    /// Destination in CIDR form
    pub dst: String,
    /// Next hop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Successful ADD result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    /// Version of the result format
    pub cni_version: String,
    /// Interfaces created
    pub interfaces: Vec<CniInterface>,
    /// Addresses assigned
    pub ips: Vec<CniIp>,
    /// Routes installed
    pub routes: Vec<CniRoute>,
}

impl CniResult {
    /// Result for a pod interface holding `address` behind `gateway`.
    pub fn new(
        cni_version: &str,
        if_name: &str,
        sandbox: &str,
        mac: MacAddr,
        address: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Self {
        let legacy = cni_version.starts_with("0.");
        Self {
            cni_version: cni_version.to_string(),
            interfaces: vec![CniInterface {
                name: if_name.to_string(),
                mac: mac.to_string(),
                sandbox: Some(sandbox.to_string()),
            }],
            ips: vec![CniIp {
                version: legacy.then(|| "4".to_string()),
                address: format!("{}/32", address),
                gateway: gateway.to_string(),
                interface: Some(0),
            }],
            routes: vec![CniRoute {
                dst: "0.0.0.0/0".to_string(),
                gw: Some(gateway.to_string()),
            }],
        }
    }
}

/// VERSION result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    /// Version of the result format
    pub cni_version: String,
    /// Versions the plugin accepts
    pub supported_versions: Vec<String>,
}

impl Default for VersionResult {
    fn default() -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Error printed on stdout when a command fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CniError {
    /// Version of the error format
    pub cni_version: String,
    /// Error code
    pub code: u32,
    /// Short message
    pub msg: String,
    /// Longer description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniError {
    /// Builds the error reported for a failed command.
    pub fn from_attach(cni_version: &str, err: &AttachError) -> Self {
        let details = match err {
            AttachError::Ipam(e) => format!("{:?}", e.code()),
            _ => String::new(),
        };
        Self {
            cni_version: cni_version.to_string(),
            code: err.cni_code(),
            msg: err.to_string(),
            details,
        }
    }
}

impl AttachError {
    /// CNI error code for this failure.
    pub fn cni_code(&self) -> u32 {
        match self {
            AttachError::InvalidConfig(_) | AttachError::Ipam(IpamError::InvalidRequest(_)) => ERR_INVALID_CONFIG,
            AttachError::Ipam(e) if e.is_retryable() => ERR_TRY_AGAIN,
            _ => ERR_PLUGIN,
        }
    }
}
