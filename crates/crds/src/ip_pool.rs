//! IPPool CRD
//!
//! Defines cluster-scoped address pools and their allocation status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "podnet.io",
    version = "v1alpha1",
    kind = "IPPool",
    status = "IPPoolStatus",
    shortname = "ippool",
    printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.totalIPCount"}"#,
    printcolumn = r#"{"name":"Allocated","type":"integer","jsonPath":".status.allocatedIPCount"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    /// Subnet the pool's addresses belong to (informational, e.g. "10.244.0.0/16")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    /// Single addresses ("10.244.0.5") or inclusive ranges ("10.244.0.10-10.244.0.20")
    pub ips: Vec<String>,

    /// Restricts which pods may draw from this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_affinity: Option<LabelSelector>,

    /// Restricts which namespaces may draw from this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_affinity: Option<LabelSelector>,

    /// Restricts which nodes may draw from this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<LabelSelector>,
}

/// Equality-based label selector.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Labels that must all be present with the given values
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

/// Identity of the pod an address is allocated to.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodOwner {
    /// Pod namespace
    pub namespace: String,

    /// Pod name
    pub name: String,

    /// Pod UID
    pub uid: String,
}

impl PodOwner {
    /// Creates an owner from its three identity fields.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }
}

impl std::fmt::Display for PodOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.uid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct IPPoolStatus {
    /// Allocated address -> owning pod
    #[serde(rename = "allocatedIPs", default)]
    pub allocated_ips: BTreeMap<String, PodOwner>,

    /// Number of addresses the pool's spec expands to
    #[serde(rename = "totalIPCount", default)]
    pub total_ip_count: u32,

    /// Number of entries in `allocatedIPs`
    #[serde(rename = "allocatedIPCount", default)]
    pub allocated_ip_count: u32,
}

impl IPPoolStatus {
    /// Returns the address currently held by `owner`, if any.
    pub fn address_of(&self, owner: &PodOwner) -> Option<&str> {
        self.allocated_ips
            .iter()
            .find(|(_, o)| *o == owner)
            .map(|(ip, _)| ip.as_str())
    }
}
