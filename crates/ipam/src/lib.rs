//! Pool-based IPv4 address management.
//!
//! Addresses are handed out from cluster-scoped `IPPool` resources. Every
//! mutation of a pool is a conditional write against the version that was
//! read; a stale write is refetched and recomputed instead of being guarded by
//! a lock, so any number of node agents can share a pool.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use crds::PodOwner;
//! use ipam::{Allocator, KubeStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let allocator = Allocator::new(Arc::new(KubeStore::new(client)));
//!
//! let owner = PodOwner::new("default", "web-0", "5b0c7a1e");
//! let address = allocator.allocate("default", &owner).await?;
//! allocator.release("default", "web-0").await?;
//! # let _ = address;
//! # Ok(())
//! # }
//! ```

pub mod address_space;
pub mod allocator;
pub mod api;
pub mod endpoint;
pub mod error;
pub mod pod;
pub mod retry;
pub mod service;
pub mod store;

#[cfg(test)]
mod allocator_test;
#[cfg(test)]
mod service_test;

pub use address_space::{AddressEntry, AddressSpace, UniverseCache};
pub use allocator::Allocator;
pub use endpoint::{EndpointLifecycle, PodReference, is_guarded, new_endpoint};
pub use error::{IpamError, StoreError};
pub use pod::{is_pod_alive, pod_owner, pool_for_pod};
pub use retry::{DEFAULT_MAX_ATTEMPTS, Mutation, with_optimistic_retry};
pub use service::IpamService;
pub use store::{KubeStore, ObjectStore, SharedStore};
#[cfg(any(test, feature = "test-util"))]
pub use store::MemoryStore;
