//! CNI command dispatch.

use crate::error::PluginError;
use attach::{AttachRequest, CniResult, Command, NetConf, Orchestrator, PodArgs, VersionResult};
use std::path::PathBuf;
use tracing::info;

/// `CNI_*` variables of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// `CNI_COMMAND`
    pub command: Command,
    /// `CNI_CONTAINERID`
    pub container_id: String,
    /// `CNI_NETNS`, empty on a DEL after the sandbox is gone
    pub netns: String,
    /// `CNI_IFNAME`
    pub if_name: String,
    /// `CNI_ARGS`
    pub args: String,
}

impl Invocation {
    /// Reads the invocation through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PluginError> {
        let command: Command = lookup("CNI_COMMAND")
            .ok_or(PluginError::MissingEnv("CNI_COMMAND"))?
            .parse()?;
        let var = |key: &'static str| lookup(key).unwrap_or_default();

        let invocation = Self {
            command,
            container_id: var("CNI_CONTAINERID"),
            netns: var("CNI_NETNS"),
            if_name: var("CNI_IFNAME"),
            args: var("CNI_ARGS"),
        };

        if command == Command::Add {
            if invocation.container_id.is_empty() {
                return Err(PluginError::MissingEnv("CNI_CONTAINERID"));
            }
            if invocation.netns.is_empty() {
                return Err(PluginError::MissingEnv("CNI_NETNS"));
            }
            if invocation.if_name.is_empty() {
                return Err(PluginError::MissingEnv("CNI_IFNAME"));
            }
        }
        Ok(invocation)
    }
}

/// Node name for the gateway lookup: the configured one, `NODE_NAME`, or
/// the host name.
pub fn node_name(conf: &NetConf, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    conf.node_name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| lookup("NODE_NAME").filter(|n| !n.is_empty()))
        .or_else(|| nix::unistd::gethostname().ok()?.into_string().ok())
}

/// VERSION output.
pub fn version() -> Result<String, PluginError> {
    Ok(serde_json::to_string(&VersionResult::default())?)
}

/// Runs ADD, DEL or CHECK. Returns what goes to stdout.
pub async fn execute(
    invocation: &Invocation,
    conf: &NetConf,
    orchestrator: &Orchestrator,
) -> Result<Option<String>, PluginError> {
    match invocation.command {
        Command::Add => {
            let request = AttachRequest {
                container_id: invocation.container_id.clone(),
                netns: PathBuf::from(&invocation.netns),
                if_name: invocation.if_name.clone(),
                pod: PodArgs::parse(&invocation.args)?,
            };
            let attachment = orchestrator.add(&request).await?;
            let result = CniResult::new(
                &conf.cni_version,
                &invocation.if_name,
                &invocation.netns,
                attachment.mac,
                attachment.address,
                attachment.gateway,
            );
            Ok(Some(serde_json::to_string(&result)?))
        }
        Command::Del => {
            let pod = PodArgs::parse(&invocation.args)?;
            orchestrator.del(&invocation.container_id, &pod).await?;
            Ok(None)
        }
        Command::Check => {
            info!("CHECK for container {} is not verified", invocation.container_id);
            Ok(None)
        }
        Command::Version => Ok(Some(version()?)),
    }
}
