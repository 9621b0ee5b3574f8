//! Allocation engine.
//!
//! Hands out pool addresses to pods and takes them back. Both directions are
//! read-modify-write cycles on the pool's status, run through
//! [`with_optimistic_retry`] so that concurrent agents never need a lock.

use crate::address_space::{UniverseCache, exclude};
use crate::endpoint::EndpointLifecycle;
use crate::error::{IpamError, StoreError};
use crate::retry::{DEFAULT_MAX_ATTEMPTS, Mutation, with_optimistic_retry};
use crate::store::SharedStore;
use crds::{IPPool, PodOwner};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Allocates and releases pool addresses.
pub struct Allocator {
    store: SharedStore,
    universes: UniverseCache,
    endpoints: EndpointLifecycle,
    max_attempts: usize,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Allocator {
    /// Creates an allocator on top of `store`.
    pub fn new(store: SharedStore) -> Self {
        Self {
            endpoints: EndpointLifecycle::new(store.clone()),
            store,
            universes: UniverseCache::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Overrides the number of conflicting writes tolerated per operation.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self.endpoints = self.endpoints.with_max_attempts(max_attempts);
        self
    }

    /// The store the allocator writes to.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Endpoint lifecycle sharing the allocator's store and retry budget.
    pub fn endpoints(&self) -> &EndpointLifecycle {
        &self.endpoints
    }

    /// Reserves an address of `pool_name` for `owner`.
    ///
    /// Returns the owner's existing address if it already holds one, so a
    /// redelivered request never takes a second address.
    pub async fn allocate(&self, pool_name: &str, owner: &PodOwner) -> Result<Ipv4Addr, IpamError> {
        let store = &self.store;

        let address = with_optimistic_retry(
            &format!("IPPool {}", pool_name),
            self.max_attempts,
            move || async move { fetch_pool(store, pool_name).await },
            |pool: IPPool| self.assign(pool, owner),
            move |pool: IPPool| async move { store.update_pool_status(&pool).await.map(drop) },
        )
        .await?;

        info!("Allocated {} from IPPool {} to {}", address, pool_name, owner);
        Ok(address)
    }

    fn assign(&self, mut pool: IPPool, owner: &PodOwner) -> Result<Mutation<IPPool, Ipv4Addr>, IpamError> {
        let pool_name = pool.metadata.name.clone().unwrap_or_default();
        let mut status = pool.status.take().unwrap_or_default();

        // An owner that already holds an address gets it back before the
        // exhaustion check, so a redelivered request succeeds on a full pool.
        if let Some(existing) = status.address_of(owner) {
            let address = existing
                .parse()
                .map_err(|e| IpamError::InvalidAddressSpec(format!("{}: {}", existing, e)))?;
            debug!("{} already holds {} in IPPool {}", owner, address, pool_name);
            return Ok(Mutation::Done(address));
        }

        let universe = self.universes.universe(&pool)?;
        let total = u32::try_from(universe.len()).unwrap_or(u32::MAX);
        let allocated = u32::try_from(status.allocated_ips.len()).unwrap_or(u32::MAX);
        if allocated >= total {
            return Err(IpamError::PoolExhausted(pool_name));
        }

        let taken: HashSet<Ipv4Addr> = status
            .allocated_ips
            .keys()
            .filter_map(|ip| ip.parse().ok())
            .collect();
        let address = exclude(&universe, &taken)
            .next()
            .ok_or_else(|| IpamError::PoolExhausted(pool_name.clone()))?;

        status.allocated_ips.insert(address.to_string(), owner.clone());
        status.allocated_ip_count = allocated + 1;
        status.total_ip_count = total;
        pool.status = Some(status);
        Ok(Mutation::Write(pool, address))
    }

    /// Returns the address of a pod to its pool and finalizes its endpoint.
    ///
    /// A pod without an endpoint has nothing to release and succeeds.
    pub async fn release(&self, namespace: &str, name: &str) -> Result<(), IpamError> {
        let Some(endpoint) = self.store.get_endpoint(namespace, name).await? else {
            debug!("No IPEndpoint for {}/{}, nothing to release", namespace, name);
            return Ok(());
        };

        let pool_name = endpoint.spec.pool.as_str();
        let address = endpoint.spec.ipv4.as_str();
        let store = &self.store;

        let released = with_optimistic_retry(
            &format!("IPPool {}", pool_name),
            self.max_attempts,
            move || async move { fetch_pool(store, pool_name).await },
            |mut pool: IPPool| {
                let Some(mut status) = pool.status.take() else {
                    return Ok(Mutation::Done(false));
                };
                let held_by_pod = status
                    .allocated_ips
                    .get(address)
                    .is_some_and(|o| o.namespace == namespace && o.name == name);
                if !held_by_pod {
                    return Ok(Mutation::Done(false));
                }
                status.allocated_ips.remove(address);
                status.allocated_ip_count = u32::try_from(status.allocated_ips.len()).unwrap_or(u32::MAX);
                pool.status = Some(status);
                Ok(Mutation::Write(pool, true))
            },
            move |pool: IPPool| async move { store.update_pool_status(&pool).await.map(drop) },
        )
        .await;

        match released {
            Ok(true) => info!("Released {} of {}/{} to IPPool {}", address, namespace, name, pool_name),
            Ok(false) => debug!("{} was not held by {}/{} in IPPool {}", address, namespace, name, pool_name),
            Err(IpamError::PoolNotFound(_)) => {
                warn!("IPPool {} of {}/{} no longer exists", pool_name, namespace, name);
            }
            Err(e) => return Err(e),
        }

        self.endpoints.finalize(namespace, name).await
    }
}

async fn fetch_pool(store: &SharedStore, name: &str) -> Result<IPPool, IpamError> {
    match store.get_pool(name).await {
        Ok(pool) => Ok(pool),
        Err(StoreError::NotFound(_)) => Err(IpamError::PoolNotFound(name.to_string())),
        Err(e) => Err(IpamError::Store(e)),
    }
}
