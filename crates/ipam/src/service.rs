//! IPAM RPC service.
//!
//! Implements Health, Allocate, Release and GetGateway on top of the
//! allocation engine. Transport lives in the agent.

use crate::allocator::Allocator;
use crate::api::{
    AllocateRequest, AllocateResponse, GatewayResponse, HealthResponse, ReleaseRequest, ReleaseResponse,
};
use crate::endpoint::{is_guarded, new_endpoint};
use crate::error::IpamError;
use crate::pod::{is_pod_alive, pod_owner, pool_for_pod};
use crate::store::SharedStore;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

/// Request handlers of the IPAM RPC surface.
#[derive(Debug, Clone)]
pub struct IpamService {
    allocator: Arc<Allocator>,
}

impl IpamService {
    /// Creates the service around an allocator.
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self { allocator }
    }

    fn store(&self) -> &SharedStore {
        self.allocator.store()
    }

    /// Health check.
    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "OK".to_string(),
        }
    }

    /// Returns the address of a pod, allocating one if needed.
    ///
    /// The pod must exist and be alive. A pod that already holds a guarded
    /// endpoint gets that address back without touching its pool.
    pub async fn allocate(&self, request: &AllocateRequest) -> Result<AllocateResponse, IpamError> {
        let (namespace, name) = (request.pod_namespace.as_str(), request.pod_name.as_str());
        if namespace.is_empty() || name.is_empty() {
            return Err(IpamError::InvalidRequest("pod namespace and name are required".to_string()));
        }
        info!("Allocate request for {}/{} (container {})", namespace, name, request.container_id);

        let pod = self
            .store()
            .get_pod(namespace, name)
            .await?
            .ok_or_else(|| IpamError::PodNotFound(format!("{}/{}", namespace, name)))?;
        let owner = pod_owner(&pod).ok_or_else(|| IpamError::PodNotFound(format!("{}/{}", namespace, name)))?;
        if !request.pod_uid.is_empty() && request.pod_uid != owner.uid {
            return Err(IpamError::PodNotFound(format!(
                "{}/{} with UID {}",
                namespace, name, request.pod_uid
            )));
        }
        if !is_pod_alive(&pod) {
            return Err(IpamError::PodNotAlive(format!("{}/{}", namespace, name)));
        }

        if let Some(endpoint) = self.store().get_endpoint(namespace, name).await? {
            if is_guarded(&endpoint) {
                if endpoint.spec.pod_uid == owner.uid {
                    info!("{}/{} already holds {}", namespace, name, endpoint.spec.ipv4);
                    return Ok(AllocateResponse {
                        address: endpoint.spec.ipv4,
                        pool: endpoint.spec.pool,
                    });
                }
                warn!(
                    "IPEndpoint {}/{} belongs to an earlier pod {}, releasing it",
                    namespace, name, endpoint.spec.pod_uid
                );
                self.allocator.release(namespace, name).await?;
            }
        }

        let pool = pool_for_pod(&pod);
        let address: Ipv4Addr = self.allocator.allocate(pool, &owner).await?;

        let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).unwrap_or_default();
        let interface = Some(request.if_name.as_str()).filter(|i| !i.is_empty());
        let endpoint = new_endpoint(pool, &owner, address, node, interface);
        self.allocator.endpoints().persist(&endpoint).await?;

        Ok(AllocateResponse {
            address: address.to_string(),
            pool: pool.to_string(),
        })
    }

    /// Releases the address of a pod.
    pub async fn release(&self, request: &ReleaseRequest) -> Result<ReleaseResponse, IpamError> {
        if request.pod_namespace.is_empty() || request.pod_name.is_empty() {
            return Err(IpamError::InvalidRequest("pod namespace and name are required".to_string()));
        }
        info!("Release request for {}/{}", request.pod_namespace, request.pod_name);
        self.allocator
            .release(&request.pod_namespace, &request.pod_name)
            .await?;
        Ok(ReleaseResponse {})
    }

    /// Gateway address of a node.
    pub async fn get_gateway(&self, node: &str) -> Result<GatewayResponse, IpamError> {
        let gateways = self.store().list_gateways().await?;
        let gateway = gateways
            .iter()
            .find_map(|g| g.spec.gateway_for(node))
            .ok_or_else(|| IpamError::GatewayNotFound(node.to_string()))?;

        Ok(GatewayResponse {
            node: node.to_string(),
            gateway_address: gateway.to_string(),
        })
    }
}
