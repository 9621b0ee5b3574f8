//! Endpoint lifecycle.
//!
//! An `IPEndpoint` records which address a pod holds. It is created with the
//! release finalizer already set, so the record cannot disappear while its
//! address is still reserved in the pool. Release removes the pool entry
//! first and only then drops the finalizer.

use crate::error::{IpamError, StoreError};
use crate::retry::{DEFAULT_MAX_ATTEMPTS, Mutation, with_optimistic_retry};
use crate::store::{ObjectStore, SharedStore};
use chrono::Utc;
use crds::{ENDPOINT_FINALIZER, IPEndpoint, IPEndpointSpec, PodOwner};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Weak reference from an endpoint back to its pod.
///
/// Holds identity only; the pod is looked up through the object store and
/// only counts as resolved while its UID still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodReference {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod UID
    pub uid: String,
}

impl PodReference {
    /// Reads the pod owner reference of an endpoint.
    pub fn from_endpoint(endpoint: &IPEndpoint) -> Option<Self> {
        let namespace = endpoint.metadata.namespace.clone()?;
        endpoint
            .metadata
            .owner_references
            .as_ref()?
            .iter()
            .find(|r| r.kind == "Pod" && r.api_version == "v1")
            .map(|r| Self {
                namespace,
                name: r.name.clone(),
                uid: r.uid.clone(),
            })
    }

    /// Looks the pod up; a pod with the same name but another UID is a different pod.
    pub async fn resolve(&self, store: &dyn ObjectStore) -> Result<Option<Pod>, StoreError> {
        let pod = store.get_pod(&self.namespace, &self.name).await?;
        Ok(pod.filter(|p| p.metadata.uid.as_deref() == Some(self.uid.as_str())))
    }
}

impl From<&PodOwner> for PodReference {
    fn from(owner: &PodOwner) -> Self {
        Self {
            namespace: owner.namespace.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
        }
    }
}

/// Builds the endpoint for a fresh allocation, guarded by the release finalizer.
pub fn new_endpoint(
    pool: &str,
    owner: &PodOwner,
    address: Ipv4Addr,
    node: &str,
    interface: Option<&str>,
) -> IPEndpoint {
    let mut endpoint = IPEndpoint::new(
        &owner.name,
        IPEndpointSpec {
            pod_uid: owner.uid.clone(),
            node: node.to_string(),
            pool: pool.to_string(),
            ipv4: address.to_string(),
            interface: interface.map(str::to_string),
            allocated_at: Some(Utc::now()),
        },
    );
    endpoint.metadata.namespace = Some(owner.namespace.clone());
    endpoint.metadata.finalizers = Some(vec![ENDPOINT_FINALIZER.to_string()]);
    endpoint.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        ..Default::default()
    }]);
    endpoint
}

/// Whether the endpoint still carries the release finalizer.
pub fn is_guarded(endpoint: &IPEndpoint) -> bool {
    endpoint
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == ENDPOINT_FINALIZER))
}

fn same_binding(a: &IPEndpointSpec, b: &IPEndpointSpec) -> bool {
    a.pod_uid == b.pod_uid && a.pool == b.pool && a.ipv4 == b.ipv4 && a.node == b.node && a.interface == b.interface
}

/// Persists and finalizes endpoints with conditional writes.
#[derive(Clone)]
pub struct EndpointLifecycle {
    store: SharedStore,
    max_attempts: usize,
}

impl std::fmt::Debug for EndpointLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointLifecycle")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl EndpointLifecycle {
    /// Creates a lifecycle manager on top of `store`.
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Overrides the number of conflicting writes tolerated per operation.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Creates the endpoint, or updates the existing record for the same pod.
    ///
    /// A record that appears or disappears between the read and the write
    /// counts as a conflict, so the next attempt starts from a fresh read.
    pub async fn persist(&self, endpoint: &IPEndpoint) -> Result<(), IpamError> {
        let namespace = endpoint.metadata.namespace.as_deref().unwrap_or("default");
        let name = endpoint.metadata.name.as_deref().unwrap_or_default();

        let store = &self.store;
        let created = with_optimistic_retry(
            &format!("IPEndpoint {}/{}", namespace, name),
            self.max_attempts,
            move || async move { store.get_endpoint(namespace, name).await.map_err(IpamError::Store) },
            |existing: Option<IPEndpoint>| {
                let Some(mut existing) = existing else {
                    return Ok(Mutation::Write(None, true));
                };
                if same_binding(&existing.spec, &endpoint.spec) && is_guarded(&existing) {
                    return Ok(Mutation::Done(false));
                }
                debug!("IPEndpoint {}/{} exists, updating it in place", namespace, name);
                existing.spec = endpoint.spec.clone();
                existing.metadata.owner_references = endpoint.metadata.owner_references.clone();
                if !is_guarded(&existing) {
                    existing
                        .metadata
                        .finalizers
                        .get_or_insert_with(Vec::new)
                        .push(ENDPOINT_FINALIZER.to_string());
                }
                Ok(Mutation::Write(Some(existing), false))
            },
            move |next: Option<IPEndpoint>| async move {
                let written = match &next {
                    None => store.create_endpoint(endpoint).await,
                    Some(next) => store.replace_endpoint(next).await,
                };
                match written {
                    Ok(_) => Ok(()),
                    Err(StoreError::AlreadyExists(msg) | StoreError::NotFound(msg)) => Err(StoreError::Conflict(msg)),
                    Err(e) => Err(e),
                }
            },
        )
        .await?;

        if created {
            info!("Created IPEndpoint {}/{} for {}", namespace, name, endpoint.spec.ipv4);
        } else {
            info!("Updated IPEndpoint {}/{} to {}", namespace, name, endpoint.spec.ipv4);
        }
        Ok(())
    }

    /// Removes the release finalizer of a pod's endpoint.
    ///
    /// Must only be called once the address is gone from its pool. Missing
    /// endpoints and endpoints without the finalizer are left alone.
    pub async fn finalize(&self, namespace: &str, name: &str) -> Result<(), IpamError> {
        let store = &self.store;
        with_optimistic_retry(
            &format!("IPEndpoint {}/{}", namespace, name),
            self.max_attempts,
            move || async move { store.get_endpoint(namespace, name).await.map_err(IpamError::from) },
            |current: Option<IPEndpoint>| {
                let Some(mut endpoint) = current else {
                    return Ok(Mutation::Done(()));
                };
                if !is_guarded(&endpoint) {
                    return Ok(Mutation::Done(()));
                }
                if let Some(finalizers) = endpoint.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != ENDPOINT_FINALIZER);
                }
                Ok(Mutation::Write(Some(endpoint), ()))
            },
            move |next: Option<IPEndpoint>| async move {
                let Some(endpoint) = next else {
                    return Ok(());
                };
                match store.replace_endpoint(&endpoint).await {
                    Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            },
        )
        .await?;

        debug!("Finalized IPEndpoint {}/{}", namespace, name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crds::{Gateway, IPPool};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn owner() -> PodOwner {
        PodOwner::new("default", "web-0", "uid-1")
    }

    #[test]
    fn test_new_endpoint_is_guarded_and_owned_by_pod() {
        let endpoint = new_endpoint("default", &owner(), Ipv4Addr::new(10, 244, 0, 1), "node-a", Some("eth0"));

        assert!(is_guarded(&endpoint));
        assert_eq!(endpoint.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(endpoint.metadata.name.as_deref(), Some("web-0"));
        assert_eq!(endpoint.spec.ipv4, "10.244.0.1");
        assert_eq!(
            PodReference::from_endpoint(&endpoint),
            Some(PodReference::from(&owner()))
        );
    }

    #[tokio::test]
    async fn test_persist_creates_then_updates_in_place() {
        let store = MemoryStore::new();
        let lifecycle = EndpointLifecycle::new(Arc::new(store.clone()));

        let first = new_endpoint("default", &owner(), Ipv4Addr::new(10, 244, 0, 1), "node-a", None);
        lifecycle.persist(&first).await.unwrap();

        // Same pod name, recreated pod with a new address
        let recreated = PodOwner::new("default", "web-0", "uid-2");
        let second = new_endpoint("default", &recreated, Ipv4Addr::new(10, 244, 0, 7), "node-a", None);
        lifecycle.persist(&second).await.unwrap();

        let stored = store.endpoint("default", "web-0").unwrap();
        assert_eq!(stored.spec.ipv4, "10.244.0.7");
        assert_eq!(stored.spec.pod_uid, "uid-2");
        assert!(is_guarded(&stored));
    }

    #[tokio::test]
    async fn test_persist_restores_missing_finalizer() {
        let store = MemoryStore::new();
        let lifecycle = EndpointLifecycle::new(Arc::new(store.clone()));

        let mut unguarded = new_endpoint("default", &owner(), Ipv4Addr::new(10, 244, 0, 1), "node-a", None);
        unguarded.metadata.finalizers = None;
        store.insert_endpoint(unguarded);

        let endpoint = new_endpoint("default", &owner(), Ipv4Addr::new(10, 244, 0, 1), "node-a", None);
        lifecycle.persist(&endpoint).await.unwrap();

        assert!(is_guarded(&store.endpoint("default", "web-0").unwrap()));
    }

    #[tokio::test]
    async fn test_finalize_removes_only_our_finalizer() {
        let store = MemoryStore::new();
        let lifecycle = EndpointLifecycle::new(Arc::new(store.clone()));

        let mut endpoint = new_endpoint("default", &owner(), Ipv4Addr::new(10, 244, 0, 1), "node-a", None);
        endpoint
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push("example.com/other".to_string());
        store.insert_endpoint(endpoint);

        lifecycle.finalize("default", "web-0").await.unwrap();

        let stored = store.endpoint("default", "web-0").unwrap();
        assert!(!is_guarded(&stored));
        assert_eq!(stored.metadata.finalizers, Some(vec!["example.com/other".to_string()]));
    }

    #[tokio::test]
    async fn test_finalize_is_a_noop_without_endpoint_or_finalizer() {
        let store = MemoryStore::new();
        let lifecycle = EndpointLifecycle::new(Arc::new(store.clone()));

        lifecycle.finalize("default", "missing").await.unwrap();

        let mut endpoint = new_endpoint("default", &owner(), Ipv4Addr::new(10, 244, 0, 1), "node-a", None);
        endpoint.metadata.finalizers = None;
        store.insert_endpoint(endpoint);
        let before = store.endpoint("default", "web-0").unwrap().metadata.resource_version;

        lifecycle.finalize("default", "web-0").await.unwrap();

        let after = store.endpoint("default", "web-0").unwrap().metadata.resource_version;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_pod_reference_ignores_recreated_pod() {
        let store = MemoryStore::new();
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "web-0", "namespace": "default", "uid": "uid-2"}
        }))
        .unwrap();
        store.insert_pod(pod);

        let stale = PodReference::from(&owner());
        assert!(stale.resolve(&store).await.unwrap().is_none());

        let current = PodReference::from(&PodOwner::new("default", "web-0", "uid-2"));
        assert!(current.resolve(&store).await.unwrap().is_some());
    }

    /// Store that reports a create as already existing while the record is
    /// absent, as when another writer creates and then deletes it.
    struct VanishingStore {
        inner: MemoryStore,
        phantom_creates: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ObjectStore for VanishingStore {
        async fn get_pool(&self, name: &str) -> Result<IPPool, StoreError> {
            self.inner.get_pool(name).await
        }
        async fn update_pool_status(&self, pool: &IPPool) -> Result<IPPool, StoreError> {
            self.inner.update_pool_status(pool).await
        }
        async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<IPEndpoint>, StoreError> {
            self.inner.get_endpoint(namespace, name).await
        }
        async fn create_endpoint(&self, endpoint: &IPEndpoint) -> Result<IPEndpoint, StoreError> {
            let pending = self.phantom_creates.load(Ordering::SeqCst);
            if pending > 0 {
                self.phantom_creates.store(pending - 1, Ordering::SeqCst);
                return Err(StoreError::AlreadyExists("IPEndpoint default/web-0".to_string()));
            }
            self.inner.create_endpoint(endpoint).await
        }
        async fn replace_endpoint(&self, endpoint: &IPEndpoint) -> Result<IPEndpoint, StoreError> {
            self.inner.replace_endpoint(endpoint).await
        }
        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, StoreError> {
            self.inner.get_pod(namespace, name).await
        }
        async fn list_gateways(&self) -> Result<Vec<Gateway>, StoreError> {
            self.inner.list_gateways().await
        }
    }

    #[tokio::test]
    async fn test_persist_retries_create_when_existing_record_vanished() {
        let store = MemoryStore::new();
        let vanishing = VanishingStore {
            inner: store.clone(),
            phantom_creates: AtomicUsize::new(2),
        };
        let lifecycle = EndpointLifecycle::new(Arc::new(vanishing));

        let endpoint = new_endpoint("default", &owner(), Ipv4Addr::new(10, 244, 0, 1), "node-a", None);
        lifecycle.persist(&endpoint).await.unwrap();

        let stored = store.endpoint("default", "web-0").unwrap();
        assert_eq!(stored.spec.ipv4, "10.244.0.1");
        assert!(is_guarded(&stored));
    }

    #[tokio::test]
    async fn test_persist_gives_up_after_attempt_budget() {
        let store = MemoryStore::new();
        let vanishing = VanishingStore {
            inner: store.clone(),
            phantom_creates: AtomicUsize::new(usize::MAX),
        };
        let lifecycle = EndpointLifecycle::new(Arc::new(vanishing)).with_max_attempts(3);

        let endpoint = new_endpoint("default", &owner(), Ipv4Addr::new(10, 244, 0, 1), "node-a", None);
        let err = lifecycle.persist(&endpoint).await.unwrap_err();

        assert!(matches!(err, IpamError::AllocationConflict { attempts: 3, .. }));
        assert!(store.endpoint("default", "web-0").is_none());
    }
}
