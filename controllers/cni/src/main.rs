//! podnet CNI plugin
//!
//! Invoked by the container runtime with a `CNI_*` environment and the
//! network configuration on stdin. Addresses come from the node agent; the
//! interfaces, routes, tc programs and dataplane map entries are set up
//! locally. Stdout carries the CNI result, so logs go to a file.

mod client;
mod error;
mod plugin;

use crate::client::AgentClient;
use crate::error::PluginError;
use crate::plugin::{Invocation, execute, node_name, version};
use attach::{AttachConfig, AttachError, Command, LinuxNetwork, NetConf, Orchestrator};
use dataplane::DataplaneMaps;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Log file used when `LOG_PATH` is not set.
const DEFAULT_LOG_PATH: &str = "/var/log/podnet/cni.log";

/// Result version used before the configuration is parsed.
const FALLBACK_CNI_VERSION: &str = "1.0.0";

fn init_logging(path: &Path) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(dir) = path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Err(_) => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(io::stderr)
            .init(),
    }
}

fn build_orchestrator(conf: &NetConf, node: String) -> Result<Orchestrator, PluginError> {
    let client = AgentClient::new(&conf.agent_url, Duration::from_secs(conf.timeout_seconds))?;
    let maps = DataplaneMaps::load(&conf.bpf_map_dir).map_err(AttachError::from)?;
    Ok(Orchestrator::new(
        Arc::new(client),
        Arc::new(LinuxNetwork::new()),
        Arc::new(maps),
        AttachConfig::from_netconf(conf, node)?,
    ))
}

async fn run(invocation: &Invocation, stdin: &[u8]) -> Result<Option<String>, (String, PluginError)> {
    let conf = NetConf::parse(stdin).map_err(|e| (FALLBACK_CNI_VERSION.to_string(), e.into()))?;
    let versioned = |e: PluginError| (conf.cni_version.clone(), e);

    let node = node_name(&conf, |key| std::env::var(key).ok())
        .ok_or_else(|| versioned(AttachError::InvalidConfig("cannot determine the node name".to_string()).into()))?;
    let orchestrator = build_orchestrator(&conf, node).map_err(versioned)?;
    execute(invocation, &conf, &orchestrator).await.map_err(versioned)
}

fn emit(out: &str) -> ExitCode {
    let mut stdout = io::stdout().lock();
    match writeln!(stdout, "{}", out).and_then(|()| stdout.flush()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn fail(cni_version: &str, err: &PluginError) -> ExitCode {
    error!("{}", err);
    let report = err.to_cni(cni_version);
    if let Ok(json) = serde_json::to_string(&report) {
        let _ = emit(&json);
    }
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let log_path = std::env::var("LOG_PATH").unwrap_or_else(|_| DEFAULT_LOG_PATH.to_string());
    init_logging(Path::new(&log_path));

    let invocation = match Invocation::from_lookup(|key| std::env::var(key).ok()) {
        Ok(invocation) => invocation,
        Err(e) => return fail(FALLBACK_CNI_VERSION, &e),
    };
    info!(
        "{:?} container={} netns={} ifname={} args={}",
        invocation.command, invocation.container_id, invocation.netns, invocation.if_name, invocation.args
    );

    if invocation.command == Command::Version {
        return match version() {
            Ok(out) => emit(&out),
            Err(e) => fail(FALLBACK_CNI_VERSION, &e),
        };
    }

    let mut stdin = Vec::new();
    if let Err(e) = io::stdin().read_to_end(&mut stdin) {
        return fail(FALLBACK_CNI_VERSION, &e.into());
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => return fail(FALLBACK_CNI_VERSION, &e.into()),
    };

    match runtime.block_on(run(&invocation, &stdin)) {
        Ok(Some(out)) => emit(&out),
        Ok(None) => ExitCode::SUCCESS,
        Err((cni_version, e)) => fail(&cni_version, &e),
    }
}
