//! Object store contract.
//!
//! The allocation engine only sees pools, endpoints, pods and gateways through
//! [`ObjectStore`]. Writes are conditional on the resource version carried in
//! the object's metadata and fail with [`StoreError::Conflict`] when it is
//! stale.

mod kubernetes;
#[cfg(any(test, feature = "test-util"))]
mod memory;

pub use kubernetes::KubeStore;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryStore;

use crate::error::StoreError;
use crds::{Gateway, IPEndpoint, IPPool};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;

/// Shared handle to an object store.
pub type SharedStore = Arc<dyn ObjectStore>;

/// Access to the cluster records the allocation engine works on.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches a pool by name.
    async fn get_pool(&self, name: &str) -> Result<IPPool, StoreError>;

    /// Writes the pool's status if its resource version is still current.
    async fn update_pool_status(&self, pool: &IPPool) -> Result<IPPool, StoreError>;

    /// Fetches the endpoint of a pod, if there is one.
    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<IPEndpoint>, StoreError>;

    /// Creates an endpoint; fails with [`StoreError::AlreadyExists`] if one exists.
    async fn create_endpoint(&self, endpoint: &IPEndpoint) -> Result<IPEndpoint, StoreError>;

    /// Replaces an endpoint if its resource version is still current.
    async fn replace_endpoint(&self, endpoint: &IPEndpoint) -> Result<IPEndpoint, StoreError>;

    /// Fetches a pod, if it exists.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, StoreError>;

    /// Lists every gateway object.
    async fn list_gateways(&self) -> Result<Vec<Gateway>, StoreError>;
}
