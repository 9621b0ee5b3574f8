//! IPEndpoint CRD
//!
//! Allocation record binding one pod attachment to one pool address. The
//! record is named after the pod and lives in the pod's namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "podnet.io",
    version = "v1alpha1",
    kind = "IPEndpoint",
    namespaced,
    shortname = "ipep",
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.ipv4"}"#,
    printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.pool"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.node"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPEndpointSpec {
    /// UID of the pod this address is bound to
    pub pod_uid: String,

    /// Node the pod runs on
    #[serde(default)]
    pub node: String,

    /// Pool the address was drawn from
    pub pool: String,

    /// Allocated IPv4 address
    pub ipv4: String,

    /// Interface name inside the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// When the address was allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<chrono::DateTime<chrono::Utc>>,
}
