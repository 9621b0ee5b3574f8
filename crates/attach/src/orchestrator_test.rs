//! Unit tests for the attach orchestrator

#[cfg(test)]
mod tests {
    use crate::cni::PodArgs;
    use crate::error::{AttachError, NetError};
    use crate::naming::{GATEWAY_HOST_LINK, host_veth_name};
    use crate::netops::{Direction, RecordingNetwork};
    use crate::orchestrator::{AddressAllocator, AttachConfig, AttachRequest, Orchestrator};
    use async_trait::async_trait;
    use crds::{Gateway, GatewaySpec, IPPool, IPPoolSpec, NodeGateway};
    use dataplane::{DataplaneMaps, DeviceRole};
    use ipam::api::{AllocateRequest, ReleaseRequest};
    use ipam::{Allocator, IpamError, IpamService, MemoryStore, StoreError};
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    const NETNS: &str = "/var/run/netns/cni-1234";
    const GATEWAY: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

    struct Fixture {
        store: MemoryStore,
        net: RecordingNetwork,
        maps: Arc<DataplaneMaps>,
        orchestrator: Orchestrator,
    }

    fn pod(name: &str, uid: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": "default", "uid": uid},
            "spec": {"nodeName": "node-a", "containers": []},
            "status": {"phase": "Pending"}
        }))
        .unwrap()
    }

    fn config(gateway: Option<Ipv4Addr>) -> AttachConfig {
        AttachConfig {
            mtu: 1450,
            gateway,
            node: "node-a".to_string(),
            program_dir: PathBuf::from("/opt/podnet"),
            tunnel_name: "podnet-vxlan".to_string(),
        }
    }

    fn fixture_with(ips: &[&str], gateway: Option<Ipv4Addr>) -> Fixture {
        let store = MemoryStore::new();
        store.insert_pool(IPPool::new(
            "default",
            IPPoolSpec {
                subnet: None,
                ips: ips.iter().map(|s| s.to_string()).collect(),
                pod_affinity: None,
                namespace_affinity: None,
                node_affinity: None,
            },
        ));
        store.insert_gateway(Gateway::new(
            "gateways",
            GatewaySpec {
                node_gateways: vec![NodeGateway {
                    node: "node-a".to_string(),
                    gateway: GATEWAY.to_string(),
                }],
            },
        ));
        store.insert_pod(pod("web-0", "uid-1"));

        let service = IpamService::new(Arc::new(Allocator::new(Arc::new(store.clone()))));
        let net = RecordingNetwork::new();
        net.add_namespace(NETNS);
        let maps = Arc::new(DataplaneMaps::in_memory());
        let orchestrator = Orchestrator::new(
            Arc::new(service),
            Arc::new(net.clone()),
            Arc::clone(&maps),
            config(gateway),
        );
        Fixture {
            store,
            net,
            maps,
            orchestrator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(&["10.244.0.1-10.244.0.2"], None)
    }

    fn request(netns: &str) -> AttachRequest {
        AttachRequest {
            container_id: "c0ffee".to_string(),
            netns: PathBuf::from(netns),
            if_name: "eth0".to_string(),
            pod: PodArgs {
                namespace: "default".to_string(),
                name: "web-0".to_string(),
                uid: "uid-1".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_add_wires_pod() {
        let f = fixture();
        let netns = Some(Path::new(NETNS));
        let pod_ip = Ipv4Addr::new(10, 244, 0, 1);

        let attachment = f.orchestrator.add(&request(NETNS)).await.unwrap();
        assert_eq!(attachment.address, pod_ip);
        assert_eq!(attachment.gateway, GATEWAY);
        assert_eq!(attachment.host_veth, host_veth_name("default", "web-0"));

        // gateway pair
        let gateway_link = f.net.link_in(None, GATEWAY_HOST_LINK).unwrap();
        assert!(gateway_link.up);
        assert_eq!(f.net.addresses_in(None, GATEWAY_HOST_LINK), vec![GATEWAY]);

        // pod side
        let pod_link = f.net.link_in(netns, "eth0").unwrap();
        assert!(pod_link.up);
        assert_eq!(pod_link.mac, attachment.mac);
        assert_eq!(f.net.addresses_in(netns, "eth0"), vec![pod_ip]);
        let routes = f.net.routes_in(netns);
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().any(|r| r.dst == GATEWAY && r.prefix_len == 32 && r.link_scope));
        assert!(routes.iter().any(|r| r.prefix_len == 0 && r.via == Some(GATEWAY)));

        // host side
        let host_link = f.net.link_in(None, &attachment.host_veth).unwrap();
        assert!(host_link.up);
        assert!(f.net.link_in(netns, &attachment.host_veth).is_none());
        assert_eq!(f.net.neighbor_in(netns, "eth0", GATEWAY), Some(host_link.mac));
        assert_eq!(
            f.net.neighbor_in(None, &attachment.host_veth, pod_ip),
            Some(pod_link.mac)
        );

        // maps
        let entry = f.maps.local_pod(pod_ip).unwrap().unwrap();
        assert_eq!(entry.ifindex, pod_link.index);
        assert_eq!(entry.host_ifindex, host_link.index);
        assert_eq!(entry.mac, pod_link.mac);
        assert_eq!(entry.host_mac, host_link.mac);
        let tunnel = f.net.link_in(None, "podnet-vxlan").unwrap();
        assert!(tunnel.up);
        assert_eq!(
            f.maps.local_device(DeviceRole::OverlayTunnel).unwrap(),
            Some(tunnel.index)
        );
        assert_eq!(
            f.maps.local_device(DeviceRole::Veth).unwrap(),
            Some(gateway_link.index)
        );

        // programs
        assert_eq!(
            f.net.filters(&attachment.host_veth, Direction::Ingress),
            vec![PathBuf::from("/opt/podnet/veth_ingress.o")]
        );
        assert_eq!(
            f.net.filters("podnet-vxlan", Direction::Ingress),
            vec![PathBuf::from("/opt/podnet/vxlan_ingress.o")]
        );
        assert_eq!(
            f.net.filters("podnet-vxlan", Direction::Egress),
            vec![PathBuf::from("/opt/podnet/vxlan_egress.o")]
        );

        // endpoint recorded by the allocator
        let endpoint = f.store.endpoint("default", "web-0").unwrap();
        assert_eq!(endpoint.spec.ipv4, "10.244.0.1");
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let f = fixture();

        let first = f.orchestrator.add(&request(NETNS)).await.unwrap();
        let created = f.net.creations();
        let second = f.orchestrator.add(&request(NETNS)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.net.creations(), created);
        assert_eq!(f.net.filters(&first.host_veth, Direction::Ingress).len(), 1);
        assert_eq!(f.maps.local_pods().unwrap().len(), 1);
        let status = f.store.pool("default").unwrap().status.unwrap();
        assert_eq!(status.allocated_ips.len(), 1);
    }

    #[tokio::test]
    async fn test_add_gateway_override_skips_lookup() {
        let f = fixture_with(&["10.244.0.1"], Some(Ipv4Addr::new(10, 0, 0, 254)));

        let attachment = f.orchestrator.add(&request(NETNS)).await.unwrap();
        assert_eq!(attachment.gateway, Ipv4Addr::new(10, 0, 0, 254));
        assert_eq!(
            f.net.addresses_in(None, GATEWAY_HOST_LINK),
            vec![Ipv4Addr::new(10, 0, 0, 254)]
        );
    }

    #[tokio::test]
    async fn test_add_replaces_stale_host_peer() {
        let f = fixture();
        let old_netns = "/var/run/netns/cni-old";
        f.net.add_namespace(old_netns);

        let old = f.orchestrator.add(&request(old_netns)).await.unwrap();
        let new = f.orchestrator.add(&request(NETNS)).await.unwrap();

        // same pod, same address, fresh pair
        assert_eq!(old.address, new.address);
        assert!(f.net.link_in(Some(Path::new(old_netns)), "eth0").is_none());
        assert!(f.net.link_in(Some(Path::new(NETNS)), "eth0").is_some());
        let entry = f.maps.local_pod(new.address).unwrap().unwrap();
        assert_eq!(entry.mac, new.mac);
    }

    #[tokio::test]
    async fn test_add_exhausted_pool_touches_nothing() {
        let f = fixture_with(&["10.244.0.1"], None);
        f.store.insert_pod(pod("web-1", "uid-2"));
        let mut other = request(NETNS);
        other.pod.name = "web-1".to_string();
        other.pod.uid = "uid-2".to_string();
        f.orchestrator.add(&other).await.unwrap();
        let created = f.net.creations();

        let netns = "/var/run/netns/cni-5678";
        f.net.add_namespace(netns);
        let err = f.orchestrator.add(&request(netns)).await.unwrap_err();
        assert!(matches!(err, AttachError::Ipam(IpamError::PoolExhausted(_))));
        assert_eq!(f.net.creations(), created);
    }

    #[tokio::test]
    async fn test_add_missing_namespace() {
        let f = fixture();
        let err = f
            .orchestrator
            .add(&request("/var/run/netns/gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, AttachError::Net(NetError::Namespace { .. })));
    }

    #[tokio::test]
    async fn test_add_failed_step_keeps_earlier_steps() {
        let f = fixture();
        f.net.fail_on("attach_filter");

        let err = f.orchestrator.add(&request(NETNS)).await.unwrap_err();
        assert!(matches!(err, AttachError::Net(NetError::Command { .. })));

        // no rollback: address and map entry stay until DEL
        let address = Ipv4Addr::new(10, 244, 0, 1);
        assert!(f.maps.local_pod(address).unwrap().is_some());
        assert!(f.store.endpoint("default", "web-0").is_some());
    }

    #[tokio::test]
    async fn test_del_releases_and_tears_down() {
        let f = fixture();
        let req = request(NETNS);
        let attachment = f.orchestrator.add(&req).await.unwrap();

        f.orchestrator.del(&req.container_id, &req.pod).await.unwrap();

        let status = f.store.pool("default").unwrap().status.unwrap();
        assert!(status.allocated_ips.is_empty());
        assert!(f.maps.local_pod(attachment.address).unwrap().is_none());
        assert!(f.net.link_in(None, &attachment.host_veth).is_none());
        assert!(f.net.link_in(Some(Path::new(NETNS)), "eth0").is_none());

        // repeated DEL still succeeds
        f.orchestrator.del(&req.container_id, &req.pod).await.unwrap();
    }

    struct UnreachableAgent;

    #[async_trait]
    impl AddressAllocator for UnreachableAgent {
        async fn health(&self) -> Result<(), IpamError> {
            Err(unreachable_err())
        }

        async fn allocate(&self, _request: &AllocateRequest) -> Result<Ipv4Addr, IpamError> {
            Err(unreachable_err())
        }

        async fn release(&self, _request: &ReleaseRequest) -> Result<(), IpamError> {
            Err(unreachable_err())
        }

        async fn gateway(&self, _node: &str) -> Result<Ipv4Addr, IpamError> {
            Err(unreachable_err())
        }
    }

    fn unreachable_err() -> IpamError {
        IpamError::Store(StoreError::Unavailable("connection refused".to_string()))
    }

    #[tokio::test]
    async fn test_del_release_failure_is_reported_and_keeps_interfaces() {
        let f = fixture();
        let req = request(NETNS);
        let attachment = f.orchestrator.add(&req).await.unwrap();

        let offline = Orchestrator::new(
            Arc::new(UnreachableAgent),
            Arc::new(f.net.clone()),
            Arc::clone(&f.maps),
            config(None),
        );
        let err = offline.del(&req.container_id, &req.pod).await.unwrap_err();
        assert_eq!(err.cni_code(), crate::cni::ERR_TRY_AGAIN);
        assert!(f.net.link_in(None, &attachment.host_veth).is_some());

        let err = offline.add(&req).await.unwrap_err();
        assert!(matches!(err, AttachError::Ipam(_)));
    }
}
