//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the IPAM RPC
//! server, the metrics server and the resource watchers of the agent.

use crate::config::AgentConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::mirror::PodMirror;
use crate::reconciler::PoolReconciler;
use crate::server::{AppState, metrics_router, router};
use crate::watcher::Watcher;
use crds::IPPool;
use dataplane::DataplaneMaps;
use ipam::{Allocator, IpamService, KubeStore, SharedStore};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller of the node agent.
pub struct Controller {
    rpc_server: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
    ip_pool_watcher: JoinHandle<Result<(), ControllerError>>,
    pod_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: AgentConfig) -> Result<Self, ControllerError> {
        info!("Initializing podnet agent on node {}", config.node_name);

        let kube_client = Client::try_default().await?;

        // The CNI plugin writes the same pinned maps; without them the node
        // cannot forward pod traffic.
        let maps = Arc::new(DataplaneMaps::load(&config.bpf_map_dir)?);
        info!("Opened dataplane maps under {}", config.bpf_map_dir.display());

        let store: SharedStore = Arc::new(KubeStore::new(kube_client.clone()));
        let allocator = Arc::new(Allocator::new(store.clone()).with_max_attempts(config.allocate_max_attempts));
        let metrics = Arc::new(Metrics::new()?);

        let state = AppState {
            service: Arc::new(IpamService::new(allocator.clone())),
            metrics: metrics.clone(),
        };

        let rpc_listener = TcpListener::bind(config.listen_addr).await?;
        info!("IPAM RPC server listening on {}", config.listen_addr);
        let rpc_server = tokio::spawn(async move {
            axum::serve(rpc_listener, router(state))
                .await
                .map_err(|e| ControllerError::Server(format!("RPC server: {}", e)))
        });

        let metrics_listener = TcpListener::bind(config.metrics_addr).await?;
        info!("Metrics server listening on {}", config.metrics_addr);
        let metrics_app = metrics_router(metrics.clone());
        let metrics_server = tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .await
                .map_err(|e| ControllerError::Server(format!("metrics server: {}", e)))
        });

        let reconciler = Arc::new(PoolReconciler::new(
            store,
            config.allocate_max_attempts,
            metrics.clone(),
        ));
        let mirror = Arc::new(PodMirror::new(maps, allocator, config.node_name.clone(), metrics));

        let ip_pool_api: Api<IPPool> = Api::all(kube_client.clone());
        let pod_api: Api<Pod> = Api::all(kube_client);
        let watcher = Arc::new(Watcher::new(reconciler, mirror, ip_pool_api, pod_api));

        let ip_pool_watcher_instance = watcher.clone();
        let ip_pool_watcher = tokio::spawn(async move { ip_pool_watcher_instance.watch_ip_pools().await });

        let pod_watcher = tokio::spawn(async move { watcher.watch_pods().await });

        Ok(Self {
            rpc_server,
            metrics_server,
            ip_pool_watcher,
            pod_watcher,
        })
    }

    /// Runs the controller until one of its tasks stops.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("podnet agent running");

        // Every task is expected to run forever
        tokio::select! {
            result = &mut self.rpc_server => {
                result.map_err(|e| ControllerError::Server(format!("RPC server panicked: {}", e)))??;
            }
            result = &mut self.metrics_server => {
                result.map_err(|e| ControllerError::Server(format!("metrics server panicked: {}", e)))??;
            }
            result = &mut self.ip_pool_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("IPPool watcher panicked: {}", e)))??;
            }
            result = &mut self.pod_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Pod watcher panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
