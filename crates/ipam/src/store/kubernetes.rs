//! Kubernetes-backed object store.

use super::ObjectStore;
use crate::error::StoreError;
use crds::{Gateway, IPEndpoint, IPPool};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::{Map, Value, json};
use tracing::debug;

/// [`ObjectStore`] on top of the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    pools: Api<IPPool>,
    gateways: Api<Gateway>,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Creates a store from a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self {
            pools: Api::all(client.clone()),
            gateways: Api::all(client.clone()),
            client,
        }
    }

    fn endpoints(&self, namespace: &str) -> Api<IPEndpoint> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Builds a merge patch that turns `current` into `desired`.
///
/// A merge patch merges maps key by key, so allocations that disappeared are
/// sent as explicit nulls. The resource version turns the patch into a
/// conditional write.
fn status_patch(desired: &IPPool, current: &IPPool) -> Result<Value, StoreError> {
    let status = desired.status.clone().unwrap_or_default();
    let mut allocated: Map<String, Value> = Map::new();

    if let Some(current_status) = &current.status {
        for ip in current_status.allocated_ips.keys() {
            if !status.allocated_ips.contains_key(ip) {
                allocated.insert(ip.clone(), Value::Null);
            }
        }
    }
    for (ip, owner) in &status.allocated_ips {
        allocated.insert(ip.clone(), serde_json::to_value(owner)?);
    }

    Ok(json!({
        "metadata": {
            "resourceVersion": desired.metadata.resource_version,
        },
        "status": {
            "allocatedIPs": allocated,
            "totalIPCount": status.total_ip_count,
            "allocatedIPCount": status.allocated_ip_count,
        }
    }))
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get_pool(&self, name: &str) -> Result<IPPool, StoreError> {
        Ok(self.pools.get(name).await?)
    }

    async fn update_pool_status(&self, pool: &IPPool) -> Result<IPPool, StoreError> {
        let name = pool.metadata.name.as_deref().unwrap_or_default();
        let current = self.pools.get_status(name).await?;

        if current.metadata.resource_version != pool.metadata.resource_version {
            return Err(StoreError::Conflict(format!(
                "IPPool {} changed since it was read",
                name
            )));
        }

        let patch = status_patch(pool, &current)?;
        debug!("Patching IPPool {} status", name);
        Ok(self
            .pools
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<IPEndpoint>, StoreError> {
        Ok(self.endpoints(namespace).get_opt(name).await?)
    }

    async fn create_endpoint(&self, endpoint: &IPEndpoint) -> Result<IPEndpoint, StoreError> {
        let namespace = endpoint.metadata.namespace.as_deref().unwrap_or("default");
        Ok(self
            .endpoints(namespace)
            .create(&PostParams::default(), endpoint)
            .await?)
    }

    async fn replace_endpoint(&self, endpoint: &IPEndpoint) -> Result<IPEndpoint, StoreError> {
        let namespace = endpoint.metadata.namespace.as_deref().unwrap_or("default");
        let name = endpoint.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .endpoints(namespace)
            .replace(name, &PostParams::default(), endpoint)
            .await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, StoreError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get_opt(name).await?)
    }

    async fn list_gateways(&self) -> Result<Vec<Gateway>, StoreError> {
        Ok(self.gateways.list(&ListParams::default()).await?.items)
    }
}
