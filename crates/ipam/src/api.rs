//! Request and response types of the IPAM RPC surface.
//!
//! Shared by the agent, which serves them, and the CNI plugin, which calls
//! them.

use serde::{Deserialize, Serialize};

/// Path of the health endpoint.
pub const HEALTH_PATH: &str = "/v1/health";
/// Path of the allocate endpoint.
pub const ALLOCATE_PATH: &str = "/v1/allocate";
/// Path of the release endpoint.
pub const RELEASE_PATH: &str = "/v1/release";
/// Path prefix of the gateway lookup; the node name follows.
pub const GATEWAY_PATH: &str = "/v1/gateway";

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    /// `"OK"` while serving
    pub status: String,
}

/// Address request for a pod attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    /// Pod namespace
    pub pod_namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Pod UID, empty when the runtime did not pass one
    #[serde(default)]
    pub pod_uid: String,
    /// Container ID of the sandbox
    #[serde(default)]
    pub container_id: String,
    /// Interface name inside the pod
    #[serde(default)]
    pub if_name: String,
}

/// Allocated address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocateResponse {
    /// IPv4 address
    pub address: String,
    /// Pool the address came from
    pub pool: String,
}

/// Release request for a pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    /// Pod namespace
    pub pod_namespace: String,
    /// Pod name
    pub pod_name: String,
}

/// Empty release response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseResponse {}

/// Gateway of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    /// Node name
    pub node: String,
    /// Gateway IPv4 address
    pub gateway_address: String,
}

/// Error codes carried in [`ErrorBody`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No free address in the pool
    PoolExhausted,
    /// Too many concurrent writers
    AllocationConflict,
    /// Pod does not exist
    PodNotFound,
    /// Pod is terminating or terminated
    PodNotAlive,
    /// Pool does not exist
    PoolNotFound,
    /// Pool spec cannot be parsed
    InvalidAddressSpec,
    /// No gateway for the node
    GatewayNotFound,
    /// Malformed request
    InvalidRequest,
    /// Object store unreachable
    Unavailable,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Wire spelling of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::PoolExhausted => "POOL_EXHAUSTED",
            ErrorCode::AllocationConflict => "ALLOCATION_CONFLICT",
            ErrorCode::PodNotFound => "POD_NOT_FOUND",
            ErrorCode::PodNotAlive => "POD_NOT_ALIVE",
            ErrorCode::PoolNotFound => "POOL_NOT_FOUND",
            ErrorCode::InvalidAddressSpec => "INVALID_ADDRESS_SPEC",
            ErrorCode::GatewayNotFound => "GATEWAY_NOT_FOUND",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// Error payload of a failed call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
}
