//! podnet CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the node agent and the
//! CNI plugin: address pools, per-pod allocation records and node gateways.

pub mod gateway;
pub mod ip_endpoint;
pub mod ip_pool;

pub use gateway::*;
pub use ip_endpoint::*;
pub use ip_pool::*;

/// Pod annotation selecting the pool an address is drawn from.
pub const POOL_ANNOTATION: &str = "podnet.io/pool";

/// Pool used when a pod carries no pool annotation.
pub const DEFAULT_POOL: &str = "default";

/// Finalizer guarding an `IPEndpoint` until its address is returned to the pool.
pub const ENDPOINT_FINALIZER: &str = "podnet.io/ipam-release";

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_resources_and_keys_share_one_group() {
        for crd in [IPPool::crd(), IPEndpoint::crd(), Gateway::crd()] {
            assert_eq!(crd.spec.group, "podnet.io");
            assert!(POOL_ANNOTATION.starts_with(&format!("{}/", crd.spec.group)));
            assert!(ENDPOINT_FINALIZER.starts_with(&format!("{}/", crd.spec.group)));
        }
    }
}
