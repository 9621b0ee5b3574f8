//! IPAM errors

use crate::api::ErrorCode;
use thiserror::Error;

/// Errors returned by an [`ObjectStore`](crate::store::ObjectStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The write was based on a stale resource version
    #[error("Version conflict: {0}")]
    Conflict(String),

    /// An object with the same identity already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The store could not be reached or rejected the request
    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(ae.message.clone())
            }
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message.clone()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Errors surfaced by the allocation engine and the RPC service.
#[derive(Debug, Error)]
pub enum IpamError {
    /// Every address of the pool is allocated
    #[error("Pool {0} is exhausted")]
    PoolExhausted(String),

    /// Conditional writes kept losing against concurrent writers
    #[error("Gave up updating {resource} after {attempts} conflicting attempts")]
    AllocationConflict {
        /// Resource being updated
        resource: String,
        /// Attempts made
        attempts: usize,
    },

    /// The requesting pod does not exist
    #[error("Pod not found: {0}")]
    PodNotFound(String),

    /// The requesting pod is terminating or has terminated
    #[error("Pod is not alive: {0}")]
    PodNotAlive(String),

    /// The pool does not exist
    #[error("IPPool not found: {0}")]
    PoolNotFound(String),

    /// A pool entry could not be parsed
    #[error("Invalid address specification: {0}")]
    InvalidAddressSpec(String),

    /// No gateway is configured for the node
    #[error("No gateway configured for node {0}")]
    GatewayNotFound(String),

    /// The request is missing required fields
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Object store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl IpamError {
    /// Wire code reported to RPC callers.
    pub fn code(&self) -> ErrorCode {
        match self {
            IpamError::PoolExhausted(_) => ErrorCode::PoolExhausted,
            IpamError::AllocationConflict { .. } => ErrorCode::AllocationConflict,
            IpamError::PodNotFound(_) => ErrorCode::PodNotFound,
            IpamError::PodNotAlive(_) => ErrorCode::PodNotAlive,
            IpamError::PoolNotFound(_) => ErrorCode::PoolNotFound,
            IpamError::InvalidAddressSpec(_) => ErrorCode::InvalidAddressSpec,
            IpamError::GatewayNotFound(_) => ErrorCode::GatewayNotFound,
            IpamError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            IpamError::Store(StoreError::Unavailable(_)) => ErrorCode::Unavailable,
            IpamError::Store(_) => ErrorCode::Internal,
        }
    }

    /// Rebuilds an error received over the wire.
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::PoolExhausted => IpamError::PoolExhausted(message),
            ErrorCode::AllocationConflict => IpamError::AllocationConflict {
                resource: message,
                attempts: 0,
            },
            ErrorCode::PodNotFound => IpamError::PodNotFound(message),
            ErrorCode::PodNotAlive => IpamError::PodNotAlive(message),
            ErrorCode::PoolNotFound => IpamError::PoolNotFound(message),
            ErrorCode::InvalidAddressSpec => IpamError::InvalidAddressSpec(message),
            ErrorCode::GatewayNotFound => IpamError::GatewayNotFound(message),
            ErrorCode::InvalidRequest => IpamError::InvalidRequest(message),
            ErrorCode::Unavailable | ErrorCode::Internal => {
                IpamError::Store(StoreError::Unavailable(message))
            }
        }
    }

    /// Whether the caller may retry the whole request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpamError::AllocationConflict { .. } | IpamError::Store(StoreError::Unavailable(_))
        )
    }
}
