//! IPPool status reconciliation.
//!
//! Keeps `totalIPCount` and `allocatedIPCount` in step with the pool's spec
//! and allocation map. Allocations themselves are never changed here.

use crate::backoff::ExponentialBackoff;
use crate::metrics::Metrics;
use crds::IPPool;
use ipam::{IpamError, Mutation, SharedStore, StoreError, UniverseCache, with_optimistic_retry};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Recomputes the derived counters of IPPool status.
pub struct PoolReconciler {
    store: SharedStore,
    universes: UniverseCache,
    max_attempts: usize,
    metrics: Arc<Metrics>,
    /// Pools with a running task, and whether another run was requested.
    in_flight: Mutex<HashMap<String, bool>>,
}

impl PoolReconciler {
    /// Creates a new reconciler instance.
    pub fn new(store: SharedStore, max_attempts: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            universes: UniverseCache::new(),
            max_attempts,
            metrics,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reconciles a pool on its own task.
    ///
    /// Each pool has at most one task, so a pool that keeps failing never
    /// holds up the others. Scheduling a pool whose task is still running
    /// makes that task run once more before it exits.
    pub fn schedule(self: &Arc<Self>, pool: &IPPool) {
        let Some(name) = pool.metadata.name.clone() else {
            return;
        };
        {
            let mut in_flight = self.lock_in_flight();
            if let Some(rerun) = in_flight.get_mut(&name) {
                debug!("IPPool {} is already being reconciled, queued another run", name);
                *rerun = true;
                return;
            }
            in_flight.insert(name.clone(), false);
        }

        let reconciler = Arc::clone(self);
        let pool = pool.clone();
        tokio::spawn(async move {
            loop {
                reconciler.reconcile_with_backoff(&pool).await;

                let mut in_flight = reconciler.lock_in_flight();
                if in_flight.get(&name).copied().unwrap_or(false) {
                    in_flight.insert(name.clone(), false);
                } else {
                    in_flight.remove(&name);
                    return;
                }
            }
        });
    }

    /// Reconciles the status of an IPPool.
    ///
    /// Returns whether a new status was written. A pool that was deleted in
    /// the meantime is skipped.
    pub async fn reconcile_pool(&self, pool: &IPPool) -> Result<bool, IpamError> {
        let name = pool.metadata.name.as_deref().unwrap_or_default();
        debug!("Reconciling IPPool {}", name);

        let store = &self.store;
        let result = with_optimistic_retry(
            &format!("IPPool {}", name),
            self.max_attempts,
            move || async move { store.get_pool(name).await.map_err(IpamError::Store) },
            |current: IPPool| self.recount(current),
            move |current: IPPool| async move { store.update_pool_status(&current).await.map(drop) },
        )
        .await;

        match result {
            Ok(true) => {
                info!("Updated status of IPPool {}", name);
                self.metrics.pool_status("updated");
                Ok(true)
            }
            Ok(false) => {
                self.metrics.pool_status("unchanged");
                Ok(false)
            }
            Err(IpamError::Store(StoreError::NotFound(_))) => {
                debug!("IPPool {} is gone, nothing to reconcile", name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn recount(&self, mut pool: IPPool) -> Result<Mutation<IPPool, bool>, IpamError> {
        let name = pool.metadata.name.clone().unwrap_or_default();
        let universe = self.universes.universe(&pool)?;
        let mut status = pool.status.clone().unwrap_or_default();

        for (address, owner) in &status.allocated_ips {
            let inside = address
                .parse::<Ipv4Addr>()
                .map(|ip| universe.contains(&ip))
                .unwrap_or(false);
            if !inside {
                warn!(
                    "IPPool {} holds {} for {} outside its address list",
                    name, address, owner
                );
            }
        }

        let total = u32::try_from(universe.len()).unwrap_or(u32::MAX);
        let allocated = u32::try_from(status.allocated_ips.len()).unwrap_or(u32::MAX);
        if status.total_ip_count == total && status.allocated_ip_count == allocated && pool.status.is_some() {
            return Ok(Mutation::Done(false));
        }

        status.total_ip_count = total;
        status.allocated_ip_count = allocated;
        pool.status = Some(status);
        Ok(Mutation::Write(pool, true))
    }

    /// Reconciles a pool, retrying transient failures with exponential backoff.
    ///
    /// Errors that another attempt cannot fix, such as an invalid address
    /// list, drop the update at once. Otherwise the update is dropped after
    /// the last retry. Either way the next change to the pool triggers a
    /// fresh attempt.
    pub async fn reconcile_with_backoff(&self, pool: &IPPool) {
        self.reconcile_with(pool, ExponentialBackoff::for_pool_status()).await
    }

    pub(crate) async fn reconcile_with(&self, pool: &IPPool, mut backoff: ExponentialBackoff) {
        let name = pool.metadata.name.as_deref().unwrap_or("<unknown>");

        loop {
            let err = match self.reconcile_pool(pool).await {
                Ok(_) => return,
                Err(e) => e,
            };

            if !err.is_retryable() {
                error!("Dropping status update of IPPool {}: {}", name, err);
                self.metrics.pool_status("dropped");
                return;
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        "Failed to reconcile IPPool {} (retry {} in {:?}): {}",
                        name,
                        backoff.attempts(),
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        "Dropping status update of IPPool {} after {} retries: {}",
                        name,
                        backoff.attempts(),
                        err
                    );
                    self.metrics.pool_status("dropped");
                    return;
                }
            }
        }
    }
}
