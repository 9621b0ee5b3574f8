//! Unit tests for the allocation engine

#[cfg(test)]
mod tests {
    use crate::address_space::AddressSpace;
    use crate::allocator::Allocator;
    use crate::endpoint::new_endpoint;
    use crate::error::{IpamError, StoreError};
    use crate::store::{MemoryStore, ObjectStore, SharedStore};
    use crds::{Gateway, IPEndpoint, IPPool, IPPoolSpec, PodOwner};
    use k8s_openapi::api::core::v1::Pod;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn pool(name: &str, ips: &[&str]) -> IPPool {
        IPPool::new(
            name,
            IPPoolSpec {
                subnet: Some("10.244.0.0/16".to_string()),
                ips: ips.iter().map(|s| s.to_string()).collect(),
                pod_affinity: None,
                namespace_affinity: None,
                node_affinity: None,
            },
        )
    }

    fn owner(name: &str) -> PodOwner {
        PodOwner::new("default", name, format!("uid-{}", name))
    }

    fn setup(ips: &[&str]) -> (MemoryStore, Allocator) {
        let store = MemoryStore::new();
        store.insert_pool(pool("default", ips));
        let shared: SharedStore = Arc::new(store.clone());
        (store, Allocator::new(shared))
    }

    /// Allocates and records the endpoint, the way the RPC service does.
    async fn allocate_with_endpoint(allocator: &Allocator, owner: &PodOwner) -> Result<Ipv4Addr, IpamError> {
        let address = allocator.allocate("default", owner).await?;
        let endpoint = new_endpoint("default", owner, address, "node-a", None);
        allocator.endpoints().persist(&endpoint).await?;
        Ok(address)
    }

    fn assert_pool_consistent(store: &MemoryStore) {
        let pool = store.pool("default").unwrap();
        let status = pool.status.clone().unwrap_or_default();
        let space = AddressSpace::parse(&pool.spec.ips).unwrap();

        assert_eq!(status.allocated_ip_count as usize, status.allocated_ips.len());
        assert!(status.allocated_ip_count <= status.total_ip_count);
        for ip in status.allocated_ips.keys() {
            assert!(space.contains(ip.parse().unwrap()), "{} is outside the pool", ip);
        }
    }

    #[tokio::test]
    async fn test_end_to_end_allocate_exhaust_release_reclaim() {
        let (store, allocator) = setup(&["10.244.0.1", "10.244.0.2"]);

        let a = allocate_with_endpoint(&allocator, &owner("a")).await.unwrap();
        let b = allocate_with_endpoint(&allocator, &owner("b")).await.unwrap();
        assert_eq!(a, Ipv4Addr::new(10, 244, 0, 1));
        assert_eq!(b, Ipv4Addr::new(10, 244, 0, 2));

        let c = allocator.allocate("default", &owner("c")).await;
        assert!(matches!(c, Err(IpamError::PoolExhausted(_))));

        allocator.release("default", "a").await.unwrap();
        let status = store.pool("default").unwrap().status.unwrap();
        assert_eq!(status.allocated_ips.len(), 1);
        assert_eq!(status.allocated_ips.get("10.244.0.2"), Some(&owner("b")));
        assert_eq!(status.allocated_ip_count, 1);

        let c = allocator.allocate("default", &owner("c")).await.unwrap();
        assert_eq!(c, Ipv4Addr::new(10, 244, 0, 1));
        assert_pool_consistent(&store);
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent_per_owner() {
        let (store, allocator) = setup(&["10.244.0.1-10.244.0.4"]);

        let first = allocator.allocate("default", &owner("a")).await.unwrap();
        let writes = store.pool_writes();
        let second = allocator.allocate("default", &owner("a")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.pool_writes(), writes);
        assert_eq!(store.pool("default").unwrap().status.unwrap().allocated_ip_count, 1);
    }

    #[tokio::test]
    async fn test_idempotent_even_when_pool_is_full() {
        let (_store, allocator) = setup(&["10.244.0.1"]);

        let first = allocator.allocate("default", &owner("a")).await.unwrap();
        assert!(matches!(
            allocator.allocate("default", &owner("b")).await,
            Err(IpamError::PoolExhausted(_))
        ));
        let again = allocator.allocate("default", &owner("a")).await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_fills_first_gap_in_universe_order() {
        let (store, allocator) = setup(&["10.244.0.9", "10.244.0.1-10.244.0.3"]);

        for name in ["a", "b", "c"] {
            allocate_with_endpoint(&allocator, &owner(name)).await.unwrap();
        }
        let status = store.pool("default").unwrap().status.unwrap();
        assert_eq!(status.allocated_ips.get("10.244.0.9"), Some(&owner("a")));
        assert_eq!(status.allocated_ips.get("10.244.0.1"), Some(&owner("b")));

        allocator.release("default", "b").await.unwrap();
        let d = allocator.allocate("default", &owner("d")).await.unwrap();
        assert_eq!(d, Ipv4Addr::new(10, 244, 0, 1));
        let e = allocator.allocate("default", &owner("e")).await.unwrap();
        assert_eq!(e, Ipv4Addr::new(10, 244, 0, 3));
        assert_pool_consistent(&store);
    }

    #[tokio::test]
    async fn test_recreated_pod_is_a_different_owner() {
        let (_store, allocator) = setup(&["10.244.0.1-10.244.0.2"]);

        let old = allocator
            .allocate("default", &PodOwner::new("default", "web-0", "uid-1"))
            .await
            .unwrap();
        let new = allocator
            .allocate("default", &PodOwner::new("default", "web-0", "uid-2"))
            .await
            .unwrap();
        assert_ne!(old, new);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_get_distinct_addresses() {
        const N: usize = 5;
        let (store, allocator) = setup(&["10.244.0.1-10.244.0.5"]);
        let allocator = Arc::new(allocator);

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let allocator = Arc::clone(&allocator);
                tokio::spawn(async move { allocator.allocate("default", &owner(&format!("pod-{}", i))).await })
            })
            .collect();

        let mut addresses = HashSet::new();
        for handle in handles {
            addresses.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(addresses.len(), N);

        let next = allocator.allocate("default", &owner("late")).await;
        assert!(matches!(next, Err(IpamError::PoolExhausted(_))));
        assert_pool_consistent(&store);
    }

    #[tokio::test]
    async fn test_zero_attempt_budget_still_tries_once() {
        let (_store, allocator) = setup(&["10.244.0.1-10.244.0.5"]);
        let allocator = allocator.with_max_attempts(0);

        let address = allocator.allocate("default", &owner("a")).await.unwrap();
        assert_eq!(address, Ipv4Addr::new(10, 244, 0, 1));
    }

    /// Store whose pool writes always lose against a concurrent writer.
    struct ContendedStore(MemoryStore);

    #[async_trait::async_trait]
    impl ObjectStore for ContendedStore {
        async fn get_pool(&self, name: &str) -> Result<IPPool, StoreError> {
            self.0.get_pool(name).await
        }
        async fn update_pool_status(&self, _pool: &IPPool) -> Result<IPPool, StoreError> {
            Err(StoreError::Conflict("IPPool default".to_string()))
        }
        async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<IPEndpoint>, StoreError> {
            self.0.get_endpoint(namespace, name).await
        }
        async fn create_endpoint(&self, endpoint: &IPEndpoint) -> Result<IPEndpoint, StoreError> {
            self.0.create_endpoint(endpoint).await
        }
        async fn replace_endpoint(&self, endpoint: &IPEndpoint) -> Result<IPEndpoint, StoreError> {
            self.0.replace_endpoint(endpoint).await
        }
        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, StoreError> {
            self.0.get_pod(namespace, name).await
        }
        async fn list_gateways(&self) -> Result<Vec<Gateway>, StoreError> {
            self.0.list_gateways().await
        }
    }

    #[tokio::test]
    async fn test_persistent_contention_surfaces_as_allocation_conflict() {
        let inner = MemoryStore::new();
        inner.insert_pool(pool("default", &["10.244.0.1-10.244.0.5"]));
        let allocator = Allocator::new(Arc::new(ContendedStore(inner))).with_max_attempts(3);

        let result = allocator.allocate("default", &owner("a")).await;
        assert!(matches!(
            result,
            Err(IpamError::AllocationConflict { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_pool() {
        let (_store, allocator) = setup(&["10.244.0.1"]);
        let result = allocator.allocate("edge", &owner("a")).await;
        assert!(matches!(result, Err(IpamError::PoolNotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_pool_spec() {
        let (store, allocator) = setup(&["10.244.0.1"]);
        store.insert_pool(pool("broken", &["10.244.0.9-10.244.0.1"]));
        let result = allocator.allocate("broken", &owner("a")).await;
        assert!(matches!(result, Err(IpamError::InvalidAddressSpec(_))));
    }

    #[tokio::test]
    async fn test_release_without_endpoint_is_a_noop() {
        let (store, allocator) = setup(&["10.244.0.1"]);
        allocator.release("default", "ghost").await.unwrap();
        assert_eq!(store.pool_writes(), 0);
    }

    #[tokio::test]
    async fn test_release_twice_is_idempotent() {
        let (store, allocator) = setup(&["10.244.0.1-10.244.0.2"]);
        allocate_with_endpoint(&allocator, &owner("a")).await.unwrap();

        allocator.release("default", "a").await.unwrap();
        allocator.release("default", "a").await.unwrap();

        let status = store.pool("default").unwrap().status.unwrap();
        assert!(status.allocated_ips.is_empty());
        assert!(!crate::endpoint::is_guarded(&store.endpoint("default", "a").unwrap()));
    }

    #[tokio::test]
    async fn test_release_leaves_address_reassigned_to_someone_else() {
        let (store, allocator) = setup(&["10.244.0.1-10.244.0.2"]);

        // Stale endpoint claims an address that now belongs to another pod
        let b = allocator.allocate("default", &owner("b")).await.unwrap();
        store.insert_endpoint(new_endpoint("default", &owner("a"), b, "node-a", None));

        allocator.release("default", "a").await.unwrap();

        let status = store.pool("default").unwrap().status.unwrap();
        assert_eq!(status.allocated_ips.get(&b.to_string()), Some(&owner("b")));
    }

    #[tokio::test]
    async fn test_release_finalizes_even_if_pool_is_gone() {
        let store = MemoryStore::new();
        let allocator = Allocator::new(Arc::new(store.clone()));
        store.insert_endpoint(new_endpoint(
            "deleted-pool",
            &owner("a"),
            Ipv4Addr::new(10, 9, 0, 1),
            "node-a",
            None,
        ));

        allocator.release("default", "a").await.unwrap();
        assert!(!crate::endpoint::is_guarded(&store.endpoint("default", "a").unwrap()));
    }
}
