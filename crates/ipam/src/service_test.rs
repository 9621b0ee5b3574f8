//! Unit tests for the IPAM RPC service

#[cfg(test)]
mod tests {
    use crate::allocator::Allocator;
    use crate::api::{AllocateRequest, ReleaseRequest};
    use crate::endpoint::is_guarded;
    use crate::error::IpamError;
    use crate::service::IpamService;
    use crate::store::MemoryStore;
    use crds::{Gateway, GatewaySpec, IPPool, IPPoolSpec, NodeGateway, POOL_ANNOTATION};
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::json;
    use std::sync::Arc;

    fn pool(name: &str, ips: &[&str]) -> IPPool {
        IPPool::new(
            name,
            IPPoolSpec {
                subnet: None,
                ips: ips.iter().map(|s| s.to_string()).collect(),
                pod_affinity: None,
                namespace_affinity: None,
                node_affinity: None,
            },
        )
    }

    fn pod(name: &str, uid: &str, phase: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": "default", "uid": uid},
            "spec": {"nodeName": "node-a", "containers": []},
            "status": {"phase": phase}
        }))
        .unwrap()
    }

    fn request(name: &str, uid: &str) -> AllocateRequest {
        AllocateRequest {
            pod_namespace: "default".to_string(),
            pod_name: name.to_string(),
            pod_uid: uid.to_string(),
            container_id: "c0ffee".to_string(),
            if_name: "eth0".to_string(),
        }
    }

    fn setup() -> (MemoryStore, IpamService) {
        let store = MemoryStore::new();
        store.insert_pool(pool("default", &["10.244.0.1-10.244.0.3"]));
        let allocator = Allocator::new(Arc::new(store.clone()));
        (store, IpamService::new(Arc::new(allocator)))
    }

    #[test]
    fn test_health() {
        let (_store, service) = setup();
        assert_eq!(service.health().status, "OK");
    }

    #[tokio::test]
    async fn test_allocate_records_endpoint() {
        let (store, service) = setup();
        store.insert_pod(pod("web-0", "uid-1", "Pending"));

        let response = service.allocate(&request("web-0", "uid-1")).await.unwrap();
        assert_eq!(response.address, "10.244.0.1");
        assert_eq!(response.pool, "default");

        let endpoint = store.endpoint("default", "web-0").unwrap();
        assert!(is_guarded(&endpoint));
        assert_eq!(endpoint.spec.ipv4, "10.244.0.1");
        assert_eq!(endpoint.spec.node, "node-a");
        assert_eq!(endpoint.spec.interface.as_deref(), Some("eth0"));
    }

    #[tokio::test]
    async fn test_allocate_uses_pool_annotation() {
        let (store, service) = setup();
        store.insert_pool(pool("edge", &["192.168.50.10"]));
        let mut annotated = pod("edge-0", "uid-9", "Pending");
        annotated.metadata.annotations = Some([(POOL_ANNOTATION.to_string(), "edge".to_string())].into());
        store.insert_pod(annotated);

        let response = service.allocate(&request("edge-0", "")).await.unwrap();
        assert_eq!(response.address, "192.168.50.10");
        assert_eq!(response.pool, "edge");
    }

    #[tokio::test]
    async fn test_repeated_allocate_returns_recorded_address() {
        let (store, service) = setup();
        store.insert_pod(pod("web-0", "uid-1", "Running"));

        let first = service.allocate(&request("web-0", "uid-1")).await.unwrap();
        let writes = store.pool_writes();
        let second = service.allocate(&request("web-0", "uid-1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.pool_writes(), writes);
    }

    #[tokio::test]
    async fn test_allocate_replaces_endpoint_of_earlier_pod() {
        let (store, service) = setup();
        store.insert_pod(pod("web-0", "uid-1", "Running"));
        service.allocate(&request("web-0", "uid-1")).await.unwrap();

        // StatefulSet pod recreated under the same name
        store.insert_pod(pod("web-0", "uid-2", "Pending"));
        let response = service.allocate(&request("web-0", "uid-2")).await.unwrap();

        let status = store.pool("default").unwrap().status.unwrap();
        assert_eq!(status.allocated_ips.len(), 1);
        assert_eq!(status.allocated_ips[&response.address].uid, "uid-2");
        assert_eq!(store.endpoint("default", "web-0").unwrap().spec.pod_uid, "uid-2");
    }

    #[tokio::test]
    async fn test_allocate_missing_pod() {
        let (_store, service) = setup();
        let result = service.allocate(&request("ghost", "")).await;
        assert!(matches!(result, Err(IpamError::PodNotFound(_))));
    }

    #[tokio::test]
    async fn test_allocate_uid_mismatch_is_not_found() {
        let (store, service) = setup();
        store.insert_pod(pod("web-0", "uid-2", "Running"));
        let result = service.allocate(&request("web-0", "uid-1")).await;
        assert!(matches!(result, Err(IpamError::PodNotFound(_))));
    }

    #[tokio::test]
    async fn test_allocate_dead_pod() {
        let (store, service) = setup();
        let mut finished = pod("job-0", "uid-3", "Succeeded");
        finished.spec.as_mut().unwrap().restart_policy = Some("Never".to_string());
        store.insert_pod(finished);

        let result = service.allocate(&request("job-0", "uid-3")).await;
        assert!(matches!(result, Err(IpamError::PodNotAlive(_))));
        assert_eq!(store.pool_writes(), 0);
    }

    #[tokio::test]
    async fn test_allocate_rejects_empty_identity() {
        let (_store, service) = setup();
        let result = service.allocate(&request("", "")).await;
        assert!(matches!(result, Err(IpamError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_release_frees_address() {
        let (store, service) = setup();
        store.insert_pod(pod("web-0", "uid-1", "Running"));
        service.allocate(&request("web-0", "uid-1")).await.unwrap();

        let release = ReleaseRequest {
            pod_namespace: "default".to_string(),
            pod_name: "web-0".to_string(),
        };
        service.release(&release).await.unwrap();
        service.release(&release).await.unwrap();

        assert!(store.pool("default").unwrap().status.unwrap().allocated_ips.is_empty());
        assert!(!is_guarded(&store.endpoint("default", "web-0").unwrap()));
    }

    #[tokio::test]
    async fn test_get_gateway() {
        let (store, service) = setup();
        store.insert_gateway(Gateway::new(
            "cluster",
            GatewaySpec {
                node_gateways: vec![NodeGateway {
                    node: "node-a".to_string(),
                    gateway: "169.254.1.1".to_string(),
                }],
            },
        ));

        let response = service.get_gateway("node-a").await.unwrap();
        assert_eq!(response.gateway_address, "169.254.1.1");

        let missing = service.get_gateway("node-z").await;
        assert!(matches!(missing, Err(IpamError::GatewayNotFound(_))));
    }
}
