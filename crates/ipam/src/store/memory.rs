//! In-memory object store for unit testing
//!
//! Mirrors the resource-version semantics of the API server: every write bumps
//! the version, and a write carrying an older version fails with
//! [`StoreError::Conflict`]. Each call yields to the scheduler first so that
//! concurrent callers interleave the way they would against a remote store.

use super::ObjectStore;
use crate::error::StoreError;
use crds::{Gateway, IPEndpoint, IPPool};
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    pools: HashMap<String, IPPool>,
    endpoints: HashMap<(String, String), IPEndpoint>,
    pods: HashMap<(String, String), Pod>,
    gateways: Vec<Gateway>,
    version: u64,
    pool_writes: usize,
    conflicts: usize,
}

impl State {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }
}

/// Mock object store for testing
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

fn key(namespace: Option<&str>, name: Option<&str>) -> (String, String) {
    (
        namespace.unwrap_or("default").to_string(),
        name.unwrap_or_default().to_string(),
    )
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds or overwrites a pool, assigning it a fresh resource version.
    pub fn insert_pool(&self, mut pool: IPPool) {
        let mut state = self.lock();
        pool.metadata.resource_version = state.next_version();
        pool.metadata.generation = Some(1);
        let name = pool.metadata.name.clone().unwrap_or_default();
        state.pools.insert(name, pool);
    }

    /// Adds or overwrites a pod.
    pub fn insert_pod(&self, mut pod: Pod) {
        let mut state = self.lock();
        pod.metadata.resource_version = state.next_version();
        let key = key(pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref());
        state.pods.insert(key, pod);
    }

    /// Removes a pod.
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.lock().pods.remove(&(namespace.to_string(), name.to_string()));
    }

    /// Adds a gateway object.
    pub fn insert_gateway(&self, gateway: Gateway) {
        self.lock().gateways.push(gateway);
    }

    /// Adds or overwrites an endpoint, assigning it a fresh resource version.
    pub fn insert_endpoint(&self, mut endpoint: IPEndpoint) {
        let mut state = self.lock();
        endpoint.metadata.resource_version = state.next_version();
        let key = key(endpoint.metadata.namespace.as_deref(), endpoint.metadata.name.as_deref());
        state.endpoints.insert(key, endpoint);
    }

    /// Current copy of a pool.
    pub fn pool(&self, name: &str) -> Option<IPPool> {
        self.lock().pools.get(name).cloned()
    }

    /// Current copy of an endpoint.
    pub fn endpoint(&self, namespace: &str, name: &str) -> Option<IPEndpoint> {
        self.lock()
            .endpoints
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of successful pool status writes.
    pub fn pool_writes(&self) -> usize {
        self.lock().pool_writes
    }

    /// Number of writes rejected for a stale resource version.
    pub fn conflicts(&self) -> usize {
        self.lock().conflicts
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get_pool(&self, name: &str) -> Result<IPPool, StoreError> {
        tokio::task::yield_now().await;
        self.lock()
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("IPPool {}", name)))
    }

    async fn update_pool_status(&self, pool: &IPPool) -> Result<IPPool, StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        let name = pool.metadata.name.clone().unwrap_or_default();

        let stored_version = match state.pools.get(&name) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => return Err(StoreError::NotFound(format!("IPPool {}", name))),
        };
        if stored_version != pool.metadata.resource_version {
            state.conflicts += 1;
            return Err(StoreError::Conflict(format!("IPPool {}", name)));
        }

        let version = state.next_version();
        state.pool_writes += 1;
        let stored = state
            .pools
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(format!("IPPool {}", name)))?;
        stored.status = pool.status.clone();
        stored.metadata.resource_version = version;
        Ok(stored.clone())
    }

    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<IPEndpoint>, StoreError> {
        tokio::task::yield_now().await;
        Ok(self.endpoint(namespace, name))
    }

    async fn create_endpoint(&self, endpoint: &IPEndpoint) -> Result<IPEndpoint, StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        let key = key(endpoint.metadata.namespace.as_deref(), endpoint.metadata.name.as_deref());
        if state.endpoints.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("IPEndpoint {}/{}", key.0, key.1)));
        }

        let mut created = endpoint.clone();
        created.metadata.resource_version = state.next_version();
        state.endpoints.insert(key, created.clone());
        Ok(created)
    }

    async fn replace_endpoint(&self, endpoint: &IPEndpoint) -> Result<IPEndpoint, StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        let key = key(endpoint.metadata.namespace.as_deref(), endpoint.metadata.name.as_deref());

        let stored = state
            .endpoints
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(format!("IPEndpoint {}/{}", key.0, key.1)))?;
        if stored.metadata.resource_version != endpoint.metadata.resource_version {
            state.conflicts += 1;
            return Err(StoreError::Conflict(format!("IPEndpoint {}/{}", key.0, key.1)));
        }

        let mut replaced = endpoint.clone();
        replaced.metadata.resource_version = state.next_version();

        // A deleting object goes away once its last finalizer is removed
        let finalized = replaced.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        if replaced.metadata.deletion_timestamp.is_some() && finalized {
            state.endpoints.remove(&key);
        } else {
            state.endpoints.insert(key, replaced.clone());
        }
        Ok(replaced)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, StoreError> {
        tokio::task::yield_now().await;
        Ok(self
            .lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_gateways(&self) -> Result<Vec<Gateway>, StoreError> {
        tokio::task::yield_now().await;
        Ok(self.lock().gateways.clone())
    }
}
