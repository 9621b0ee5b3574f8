//! Typed access to the three dataplane maps.

use crate::error::DataplaneError;
use crate::map::{MapBackend, PinnedMap};
use crate::records::{
    CLUSTER_POD_IPS_MAP, DeviceRole, LOCAL_DEV_MAP, LOCAL_POD_IPS_MAP, LOCAL_POD_VALUE_SIZE, LocalPodValue, WORD_SIZE,
    ip_from_bytes, ip_to_bytes,
};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Directory the tc programs pin their maps in.
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/tc/globals";

type WordMap = Box<dyn MapBackend<WORD_SIZE, WORD_SIZE>>;
type LocalPodMap = Box<dyn MapBackend<WORD_SIZE, LOCAL_POD_VALUE_SIZE>>;

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handles to the local device, local pod and cluster pod maps.
///
/// Built once at startup; a process that cannot build it must not serve.
pub struct DataplaneMaps {
    local_dev: Mutex<WordMap>,
    local_pods: Mutex<LocalPodMap>,
    cluster_pods: Mutex<WordMap>,
}

impl std::fmt::Debug for DataplaneMaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataplaneMaps").finish_non_exhaustive()
    }
}

impl DataplaneMaps {
    /// Opens the maps pinned under `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, DataplaneError> {
        let dir = dir.as_ref();
        info!("Loading dataplane maps from {}", dir.display());

        let local_dev = PinnedMap::<WORD_SIZE, WORD_SIZE>::open(LOCAL_DEV_MAP, &dir.join(LOCAL_DEV_MAP))?;
        let local_pods =
            PinnedMap::<WORD_SIZE, LOCAL_POD_VALUE_SIZE>::open(LOCAL_POD_IPS_MAP, &dir.join(LOCAL_POD_IPS_MAP))?;
        let cluster_pods =
            PinnedMap::<WORD_SIZE, WORD_SIZE>::open(CLUSTER_POD_IPS_MAP, &dir.join(CLUSTER_POD_IPS_MAP))?;

        Ok(Self::from_backends(
            Box::new(local_dev),
            Box::new(local_pods),
            Box::new(cluster_pods),
        ))
    }

    /// Builds the context from explicit backends.
    pub fn from_backends(local_dev: WordMap, local_pods: LocalPodMap, cluster_pods: WordMap) -> Self {
        Self {
            local_dev: Mutex::new(local_dev),
            local_pods: Mutex::new(local_pods),
            cluster_pods: Mutex::new(cluster_pods),
        }
    }

    /// Context backed by empty in-memory maps.
    #[cfg(any(test, feature = "test-util"))]
    pub fn in_memory() -> Self {
        use crate::map::MemoryMap;
        Self::from_backends(
            Box::new(MemoryMap::new()),
            Box::new(MemoryMap::new()),
            Box::new(MemoryMap::new()),
        )
    }

    /// Publishes the current ifindex of a singleton device.
    pub fn upsert_local_device(&self, role: DeviceRole, ifindex: u32) -> Result<(), DataplaneError> {
        debug!("local_dev[{:?}] = {}", role, ifindex);
        lock(&self.local_dev).upsert(role.to_key(), ifindex.to_ne_bytes())
    }

    /// Reads the published ifindex of a singleton device.
    pub fn local_device(&self, role: DeviceRole) -> Result<Option<u32>, DataplaneError> {
        Ok(lock(&self.local_dev).get(&role.to_key())?.map(u32::from_ne_bytes))
    }

    /// Publishes the forwarding metadata of a local pod.
    pub fn upsert_local_pod(&self, ip: Ipv4Addr, value: &LocalPodValue) -> Result<(), DataplaneError> {
        debug!(
            "local_pod_ips[{}] = ifindex {} host ifindex {}",
            ip, value.ifindex, value.host_ifindex
        );
        lock(&self.local_pods).upsert(ip_to_bytes(ip), value.to_bytes())
    }

    /// Reads the forwarding metadata of a local pod.
    pub fn local_pod(&self, ip: Ipv4Addr) -> Result<Option<LocalPodValue>, DataplaneError> {
        Ok(lock(&self.local_pods)
            .get(&ip_to_bytes(ip))?
            .map(|v| LocalPodValue::from_bytes(&v)))
    }

    /// Removes a local pod; returns whether it was present.
    pub fn delete_local_pod(&self, ip: Ipv4Addr) -> Result<bool, DataplaneError> {
        lock(&self.local_pods).delete(&ip_to_bytes(ip))
    }

    /// Every local pod entry.
    pub fn local_pods(&self) -> Result<Vec<(Ipv4Addr, LocalPodValue)>, DataplaneError> {
        Ok(lock(&self.local_pods)
            .entries()?
            .into_iter()
            .map(|(k, v)| (ip_from_bytes(k), LocalPodValue::from_bytes(&v)))
            .collect())
    }

    /// Removes every local pod entry pointing at the host-side peer `host_ifindex`.
    pub fn delete_local_pods_by_host_ifindex(&self, host_ifindex: u32) -> Result<Vec<Ipv4Addr>, DataplaneError> {
        let mut map = lock(&self.local_pods);
        let stale: Vec<[u8; WORD_SIZE]> = map
            .entries()?
            .into_iter()
            .filter(|(_, v)| LocalPodValue::from_bytes(v).host_ifindex == host_ifindex)
            .map(|(k, _)| k)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for key in stale {
            if map.delete(&key)? {
                removed.push(ip_from_bytes(key));
            }
        }
        Ok(removed)
    }

    /// Records the node hosting a pod.
    pub fn upsert_cluster_pod(&self, pod_ip: Ipv4Addr, node_ip: Ipv4Addr) -> Result<(), DataplaneError> {
        debug!("cluster_pod_ips[{}] = {}", pod_ip, node_ip);
        lock(&self.cluster_pods).upsert(ip_to_bytes(pod_ip), ip_to_bytes(node_ip))
    }

    /// Node recorded for a pod.
    pub fn cluster_pod(&self, pod_ip: Ipv4Addr) -> Result<Option<Ipv4Addr>, DataplaneError> {
        Ok(lock(&self.cluster_pods).get(&ip_to_bytes(pod_ip))?.map(ip_from_bytes))
    }

    /// Forgets a pod; returns whether it was present.
    pub fn delete_cluster_pod(&self, pod_ip: Ipv4Addr) -> Result<bool, DataplaneError> {
        lock(&self.cluster_pods).delete(&ip_to_bytes(pod_ip))
    }

    /// Every cluster pod entry.
    pub fn cluster_pods(&self) -> Result<Vec<(Ipv4Addr, Ipv4Addr)>, DataplaneError> {
        Ok(lock(&self.cluster_pods)
            .entries()?
            .into_iter()
            .map(|(k, v)| (ip_from_bytes(k), ip_from_bytes(v)))
            .collect())
    }
}
