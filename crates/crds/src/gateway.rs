//! Gateway CRD
//!
//! Per-node gateway addresses assigned to the host side of the gateway pair.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(group = "podnet.io", version = "v1alpha1", kind = "Gateway")]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Gateway address for each node
    #[serde(default)]
    pub node_gateways: Vec<NodeGateway>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeGateway {
    /// Node name
    pub node: String,

    /// Gateway IPv4 address on that node
    pub gateway: String,
}

impl GatewaySpec {
    /// Returns the gateway configured for `node`.
    pub fn gateway_for(&self, node: &str) -> Option<&str> {
        self.node_gateways
            .iter()
            .find(|g| g.node == node)
            .map(|g| g.gateway.as_str())
    }
}
