//! Kubernetes resource watchers.
//!
//! This module handles watching Kubernetes resources for changes
//! and triggering reconciliation.

use crate::error::ControllerError;
use crate::mirror::PodMirror;
use crate::reconciler::PoolReconciler;
use crds::IPPool;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube_runtime::{WatchStreamExt, watcher};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    reconciler: Arc<PoolReconciler>,
    mirror: Arc<PodMirror>,
    ip_pool_api: Api<IPPool>,
    pod_api: Api<Pod>,
}

fn pod_name(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or("<unknown>")
    )
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<PoolReconciler>,
        mirror: Arc<PodMirror>,
        ip_pool_api: Api<IPPool>,
        pod_api: Api<Pod>,
    ) -> Self {
        Self {
            reconciler,
            mirror,
            ip_pool_api,
            pod_api,
        }
    }

    /// Starts watching IPPool resources.
    ///
    /// Each applied pool is reconciled on its own task. Stream errors are
    /// logged and the watch is re-established with backoff.
    pub async fn watch_ip_pools(&self) -> Result<(), ControllerError> {
        info!("Starting IPPool watcher");

        let mut stream = Box::pin(watcher(self.ip_pool_api.clone(), watcher::Config::default()).default_backoff());

        while let Some(result) = stream.next().await {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!("IPPool watch error: {}", e);
                    continue;
                }
            };

            match event {
                watcher::Event::Apply(pool) => {
                    debug!("IPPool applied: {}", pool.metadata.name.as_deref().unwrap_or("<unknown>"));
                    self.reconciler.schedule(&pool);
                }
                watcher::Event::Delete(pool) => {
                    info!("IPPool deleted: {}", pool.metadata.name.as_deref().unwrap_or("<unknown>"));
                }
                watcher::Event::Init => {
                    debug!("IPPool watcher initialized");
                }
                watcher::Event::InitApply(pool) => {
                    debug!("IPPool init apply: {}", pool.metadata.name.as_deref().unwrap_or("<unknown>"));
                    self.reconciler.schedule(&pool);
                }
                watcher::Event::InitDone => {
                    debug!("IPPool watcher initialization complete");
                }
            }
        }

        Err(ControllerError::Watch("IPPool watch stream ended".to_string()))
    }

    /// Starts watching pods across all namespaces.
    pub async fn watch_pods(&self) -> Result<(), ControllerError> {
        info!("Starting Pod watcher");

        let mut stream = Box::pin(watcher(self.pod_api.clone(), watcher::Config::default()).default_backoff());

        while let Some(result) = stream.next().await {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!("Pod watch error: {}", e);
                    continue;
                }
            };

            match event {
                watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                    if let Err(e) = self.mirror.apply(&pod) {
                        warn!("Failed to mirror Pod {}: {}", pod_name(&pod), e);
                    }
                }
                watcher::Event::Delete(pod) => {
                    debug!("Pod deleted: {}", pod_name(&pod));
                    if let Err(e) = self.mirror.remove(&pod).await {
                        warn!("Failed to withdraw Pod {}: {}", pod_name(&pod), e);
                    }
                }
                watcher::Event::Init => {
                    debug!("Pod watcher initialized");
                    self.mirror.begin_resync();
                }
                watcher::Event::InitDone => {
                    info!("Pod watcher initialization complete");
                    if let Err(e) = self.mirror.finish_resync().await {
                        warn!("Failed to finish pod resync: {}", e);
                    }
                }
            }
        }

        Err(ControllerError::Watch("Pod watch stream ended".to_string()))
    }
}
