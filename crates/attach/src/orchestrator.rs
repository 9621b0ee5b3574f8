//! Attach (ADD) and detach (DEL) sequences.
//!
//! Every step checks before it creates, so a redelivered ADD converges on
//! the same interfaces, routes, map entries and filters. A failing step
//! aborts the sequence without rolling back; the runtime follows up with
//! DEL.

use crate::cni::{NetConf, PodArgs};
use crate::error::{AttachError, NetError};
use crate::naming::{
    GATEWAY_HOST_LINK, GATEWAY_LINK_MTU, GATEWAY_NET_LINK, TUNNEL_EGRESS_PROGRAM, TUNNEL_INGRESS_PROGRAM,
    VETH_INGRESS_PROGRAM, host_veth_name,
};
use crate::netops::{Direction, LinkInfo, NetworkOps, Route};
use async_trait::async_trait;
use dataplane::{DataplaneMaps, DeviceRole, LocalPodValue, MacAddr};
use ipam::api::{AllocateRequest, ReleaseRequest};
use ipam::{IpamError, IpamService};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Address management as seen by the orchestrator.
#[async_trait]
pub trait AddressAllocator: Send + Sync {
    /// Fails when the allocator cannot serve requests.
    async fn health(&self) -> Result<(), IpamError>;

    /// Address of the pod, allocated on first use.
    async fn allocate(&self, request: &AllocateRequest) -> Result<Ipv4Addr, IpamError>;

    /// Returns the pod's address to its pool.
    async fn release(&self, request: &ReleaseRequest) -> Result<(), IpamError>;

    /// Gateway address of a node.
    async fn gateway(&self, node: &str) -> Result<Ipv4Addr, IpamError>;
}

/// Parses an address received from the allocator.
pub fn parse_address(address: &str) -> Result<Ipv4Addr, IpamError> {
    address
        .parse()
        .map_err(|_| IpamError::InvalidAddressSpec(format!("allocator returned {:?}", address)))
}

#[async_trait]
impl AddressAllocator for IpamService {
    async fn health(&self) -> Result<(), IpamError> {
        IpamService::health(self);
        Ok(())
    }

    async fn allocate(&self, request: &AllocateRequest) -> Result<Ipv4Addr, IpamError> {
        let response = IpamService::allocate(self, request).await?;
        parse_address(&response.address)
    }

    async fn release(&self, request: &ReleaseRequest) -> Result<(), IpamError> {
        IpamService::release(self, request).await?;
        Ok(())
    }

    async fn gateway(&self, node: &str) -> Result<Ipv4Addr, IpamError> {
        let response = self.get_gateway(node).await?;
        parse_address(&response.gateway_address)
    }
}

/// Settings of the attach sequence.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    /// MTU of the pod pair
    pub mtu: u32,
    /// Gateway to use instead of asking the allocator
    pub gateway: Option<Ipv4Addr>,
    /// Node this plugin runs on
    pub node: String,
    /// Directory holding the tc objects
    pub program_dir: PathBuf,
    /// Overlay tunnel device name
    pub tunnel_name: String,
}

impl AttachConfig {
    /// Settings from a network configuration.
    pub fn from_netconf(conf: &NetConf, node: impl Into<String>) -> Result<Self, AttachError> {
        Ok(Self {
            mtu: conf.mtu,
            gateway: conf.gateway_override()?,
            node: node.into(),
            program_dir: conf.program_dir.clone(),
            tunnel_name: conf.tunnel_name.clone(),
        })
    }
}

/// One ADD invocation.
#[derive(Debug, Clone)]
pub struct AttachRequest {
    /// Sandbox container ID
    pub container_id: String,
    /// Path of the sandbox network namespace
    pub netns: PathBuf,
    /// Interface name inside the sandbox
    pub if_name: String,
    /// Pod identity
    pub pod: PodArgs,
}

/// Outcome of a successful ADD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Address assigned to the pod interface
    pub address: Ipv4Addr,
    /// Gateway the pod routes through
    pub gateway: Ipv4Addr,
    /// MAC of the pod interface
    pub mac: MacAddr,
    /// Name of the host-side peer
    pub host_veth: String,
}

/// Runs attach and detach against an allocator, the kernel and the
/// dataplane maps.
pub struct Orchestrator {
    allocator: Arc<dyn AddressAllocator>,
    net: Arc<dyn NetworkOps>,
    maps: Arc<DataplaneMaps>,
    config: AttachConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    pub fn new(
        allocator: Arc<dyn AddressAllocator>,
        net: Arc<dyn NetworkOps>,
        maps: Arc<DataplaneMaps>,
        config: AttachConfig,
    ) -> Self {
        Self {
            allocator,
            net,
            maps,
            config,
        }
    }

    /// Attaches a sandbox to the pod network.
    pub async fn add(&self, request: &AttachRequest) -> Result<Attachment, AttachError> {
        let pod = &request.pod;
        info!(
            "Attaching {}/{} (container {}) as {}",
            pod.namespace, pod.name, request.container_id, request.if_name
        );

        self.allocator.health().await?;
        let address = self
            .allocator
            .allocate(&AllocateRequest {
                pod_namespace: pod.namespace.clone(),
                pod_name: pod.name.clone(),
                pod_uid: pod.uid.clone(),
                container_id: request.container_id.clone(),
                if_name: request.if_name.clone(),
            })
            .await?;
        let gateway = match self.config.gateway {
            Some(gateway) => gateway,
            None => self.allocator.gateway(&self.config.node).await?,
        };
        debug!("{}/{} gets {} via {}", pod.namespace, pod.name, address, gateway);

        let gateway_link = self.ensure_gateway_pair(gateway)?;
        self.maps.upsert_local_device(DeviceRole::Veth, gateway_link.index)?;

        let host_veth = host_veth_name(&pod.namespace, &pod.name);
        let pod_link = self.plumb_namespace(request, &host_veth, address, gateway)?;

        self.net.set_link_up(&host_veth)?;
        self.net.replace_neighbor(&host_veth, address, pod_link.mac)?;
        let host_link = self.require_link(&host_veth)?;

        self.maps.upsert_local_pod(
            address,
            &LocalPodValue {
                ifindex: pod_link.index,
                host_ifindex: host_link.index,
                mac: pod_link.mac,
                host_mac: host_link.mac,
            },
        )?;

        self.attach_program(&host_veth, Direction::Ingress, VETH_INGRESS_PROGRAM)?;
        self.ensure_tunnel()?;

        info!(
            "Attached {}/{}: {} on {} (host peer {})",
            pod.namespace, pod.name, address, request.if_name, host_veth
        );
        Ok(Attachment {
            address,
            gateway,
            mac: pod_link.mac,
            host_veth,
        })
    }

    /// Detaches a sandbox.
    ///
    /// Only the release can fail the call; interface and map cleanup after
    /// it is best effort.
    pub async fn del(&self, container_id: &str, pod: &PodArgs) -> Result<(), AttachError> {
        info!("Detaching {}/{} (container {})", pod.namespace, pod.name, container_id);
        self.allocator
            .release(&ReleaseRequest {
                pod_namespace: pod.namespace.clone(),
                pod_name: pod.name.clone(),
            })
            .await?;

        let host_veth = host_veth_name(&pod.namespace, &pod.name);
        match self.net.link(&host_veth) {
            Ok(Some(link)) => {
                match self.maps.delete_local_pods_by_host_ifindex(link.index) {
                    Ok(removed) => debug!("Removed local pod entries {:?}", removed),
                    Err(e) => warn!("Failed to clear local pod entries for {}: {}", host_veth, e),
                }
                if let Err(e) = self.net.delete_link(&host_veth) {
                    warn!("Failed to delete {}: {}", host_veth, e);
                }
            }
            Ok(None) => debug!("Host peer {} already gone", host_veth),
            Err(e) => warn!("Failed to look up {}: {}", host_veth, e),
        }
        Ok(())
    }

    fn require_link(&self, name: &str) -> Result<LinkInfo, NetError> {
        self.net
            .link(name)?
            .ok_or_else(|| NetError::LinkNotFound(name.to_string()))
    }

    fn ensure_gateway_pair(&self, gateway: Ipv4Addr) -> Result<LinkInfo, NetError> {
        let host = self.net.link(GATEWAY_HOST_LINK)?;
        let peer = self.net.link(GATEWAY_NET_LINK)?;
        if host.is_none() || peer.is_none() {
            info!("Creating gateway pair {} <-> {}", GATEWAY_HOST_LINK, GATEWAY_NET_LINK);
            self.net
                .create_veth_pair(GATEWAY_HOST_LINK, GATEWAY_NET_LINK, GATEWAY_LINK_MTU)?;
        }
        self.net.set_link_up(GATEWAY_HOST_LINK)?;
        self.net.set_link_up(GATEWAY_NET_LINK)?;
        if !self.net.addresses(GATEWAY_HOST_LINK)?.contains(&gateway) {
            self.net.add_address(GATEWAY_HOST_LINK, gateway, 32)?;
        }
        self.require_link(GATEWAY_HOST_LINK)
    }

    /// Creates and configures the pod pair, leaving the host peer in the host
    /// namespace. Returns the pod interface.
    fn plumb_namespace(
        &self,
        request: &AttachRequest,
        host_veth: &str,
        address: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<LinkInfo, NetError> {
        let if_name = request.if_name.as_str();
        let mtu = self.config.mtu;

        let mut attached = false;
        self.net.in_namespace(&request.netns, &mut |ns| {
            attached = ns.link(if_name)?.is_some();
            Ok(())
        })?;

        // A host peer without a pod interface belongs to an earlier sandbox
        // of the same pod.
        let known_peer_mac = match self.net.link(host_veth)? {
            Some(peer) if attached => Some(peer.mac),
            Some(stale) => {
                warn!("Removing stale host peer {}", stale.name);
                self.net.delete_link(&stale.name)?;
                None
            }
            None => None,
        };

        let mut pod_link = None;
        self.net.in_namespace(&request.netns, &mut |ns| {
            if ns.link(if_name)?.is_none() {
                ns.create_veth_pair(if_name, host_veth, mtu)?;
            }
            let peer_mac = match ns.link(host_veth)? {
                Some(peer) => {
                    ns.move_link_to_host(host_veth)?;
                    peer.mac
                }
                None => known_peer_mac.ok_or_else(|| NetError::LinkNotFound(host_veth.to_string()))?,
            };

            ns.add_address(if_name, address, 32)?;
            ns.set_link_up(if_name)?;
            ns.replace_route(&Route {
                dst: gateway,
                prefix_len: 32,
                via: None,
                dev: if_name.to_string(),
                link_scope: true,
            })?;
            ns.replace_route(&Route {
                dst: Ipv4Addr::UNSPECIFIED,
                prefix_len: 0,
                via: Some(gateway),
                dev: if_name.to_string(),
                link_scope: false,
            })?;
            // Static entry so the first packet skips ARP for the gateway.
            ns.replace_neighbor(if_name, gateway, peer_mac)?;

            pod_link = ns.link(if_name)?;
            Ok(())
        })?;

        pod_link.ok_or_else(|| NetError::LinkNotFound(if_name.to_string()))
    }

    fn attach_program(&self, dev: &str, direction: Direction, program: &str) -> Result<(), NetError> {
        self.net.ensure_clsact(dev)?;
        if self.net.has_filter(dev, direction)? {
            debug!("{} {} already has a filter", dev, direction);
            return Ok(());
        }
        let object = self.config.program_dir.join(program);
        info!("Attaching {} to {} {}", object.display(), dev, direction);
        self.net.attach_filter(dev, direction, &object)
    }

    fn ensure_tunnel(&self) -> Result<(), AttachError> {
        let tunnel = self.config.tunnel_name.as_str();
        if self.net.link(tunnel)?.is_none() {
            info!("Creating overlay tunnel {}", tunnel);
            self.net.create_vxlan(tunnel)?;
        }
        self.net.set_link_up(tunnel)?;
        let link = self.require_link(tunnel)?;
        self.maps.upsert_local_device(DeviceRole::OverlayTunnel, link.index)?;

        self.attach_program(tunnel, Direction::Ingress, TUNNEL_INGRESS_PROGRAM)?;
        self.attach_program(tunnel, Direction::Egress, TUNNEL_EGRESS_PROGRAM)?;
        Ok(())
    }
}
