//! Cluster pod placement mirror.
//!
//! Every pod with an IPv4 pod IP and a host IP is published into
//! `cluster_pod_ips`, so the tunnel programs know which node to encapsulate
//! to. Pods removed from this node also get their address released, which
//! reclaims addresses whose DEL never arrived.

use crate::error::ControllerError;
use crate::metrics::Metrics;
use dataplane::DataplaneMaps;
use ipam::Allocator;
use k8s_openapi::api::core::v1::Pod;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

type PodKey = (String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
struct MirroredPod {
    uid: String,
    ip: Ipv4Addr,
    node: String,
    node_ip: Ipv4Addr,
}

#[derive(Debug, Default)]
struct State {
    known: HashMap<PodKey, MirroredPod>,
    // Keys seen since the last watch (re)start, `None` outside a resync.
    resync: Option<HashSet<PodKey>>,
}

/// Mirrors pod placements into the cluster-wide dataplane map.
pub struct PodMirror {
    maps: Arc<DataplaneMaps>,
    allocator: Arc<Allocator>,
    node_name: String,
    metrics: Arc<Metrics>,
    state: Mutex<State>,
}

fn pod_key(pod: &Pod) -> PodKey {
    (
        pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

fn placement(pod: &Pod) -> Option<MirroredPod> {
    let status = pod.status.as_ref()?;
    let ip = status.pod_ip.as_deref()?.parse::<Ipv4Addr>().ok()?;
    let node_ip = status.host_ip.as_deref()?.parse::<Ipv4Addr>().ok()?;
    // A host-network pod shares its node's address; nothing to route.
    if ip == node_ip {
        return None;
    }
    Some(MirroredPod {
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        ip,
        node: pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
        node_ip,
    })
}

fn host_network(pod: &Pod) -> bool {
    pod.spec.as_ref().and_then(|s| s.host_network).unwrap_or(false)
}

impl PodMirror {
    /// Creates a mirror for the agent running on `node_name`.
    pub fn new(
        maps: Arc<DataplaneMaps>,
        allocator: Arc<Allocator>,
        node_name: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            maps,
            allocator,
            node_name: node_name.into(),
            metrics,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publishes the placement of a pod.
    ///
    /// A pod that is being deleted is withdrawn from the map; its address is
    /// released once the pod is gone.
    pub fn apply(&self, pod: &Pod) -> Result<(), ControllerError> {
        let key = pod_key(pod);
        if let Some(seen) = self.lock().resync.as_mut() {
            seen.insert(key.clone());
        }

        if pod.metadata.deletion_timestamp.is_some() || host_network(pod) {
            return self.withdraw(&key).map(drop);
        }

        let Some(entry) = placement(pod) else {
            debug!("Pod {}/{} has no address yet", key.0, key.1);
            return Ok(());
        };

        let previous = self.lock().known.get(&key).cloned();
        if let Some(previous) = &previous {
            if previous.ip != entry.ip {
                self.maps.delete_cluster_pod(previous.ip)?;
            }
        }
        self.maps.upsert_cluster_pod(entry.ip, entry.node_ip)?;
        if previous.as_ref() != Some(&entry) {
            debug!("Mirrored {}/{} at {} on {}", key.0, key.1, entry.ip, entry.node_ip);
        }

        let mut state = self.lock();
        state.known.insert(key, entry);
        self.metrics.set_cluster_pods(state.known.len());
        Ok(())
    }

    /// Withdraws a removed pod and releases its address if it ran on this node.
    pub async fn remove(&self, pod: &Pod) -> Result<(), ControllerError> {
        let key = pod_key(pod);
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();

        let withdrawn = self.withdraw(&key)?;
        let local = withdrawn.as_ref().map(|p| p.node.as_str()).unwrap_or(node.as_str()) == self.node_name;
        if local && !host_network(pod) {
            self.release(&key, &uid).await;
        }
        Ok(())
    }

    fn withdraw(&self, key: &PodKey) -> Result<Option<MirroredPod>, ControllerError> {
        let removed = {
            let mut state = self.lock();
            let removed = state.known.remove(key);
            self.metrics.set_cluster_pods(state.known.len());
            removed
        };
        if let Some(pod) = &removed {
            self.maps.delete_cluster_pod(pod.ip)?;
            debug!("Withdrew {}/{} at {}", key.0, key.1, pod.ip);
        }
        Ok(removed)
    }

    // Releases only when the endpoint still belongs to the removed pod, so a
    // late event never frees the address of a successor with the same name.
    async fn release(&self, key: &PodKey, uid: &str) {
        let (namespace, name) = (key.0.as_str(), key.1.as_str());
        let endpoint = match self.allocator.store().get_endpoint(namespace, name).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to look up IPEndpoint {}/{}: {}", namespace, name, e);
                return;
            }
        };
        if !uid.is_empty() && endpoint.spec.pod_uid != uid {
            debug!(
                "IPEndpoint {}/{} belongs to pod {}, not releasing",
                namespace, name, endpoint.spec.pod_uid
            );
            return;
        }

        match self.allocator.release(namespace, name).await {
            Ok(()) => info!("Released address of removed pod {}/{}", namespace, name),
            Err(e) => warn!("Failed to release address of removed pod {}/{}: {}", namespace, name, e),
        }
    }

    /// Marks the start of a full resync.
    pub fn begin_resync(&self) {
        self.lock().resync = Some(HashSet::new());
    }

    /// Ends a resync: pods not listed again are treated as removed, and map
    /// entries nobody claims are deleted.
    pub async fn finish_resync(&self) -> Result<(), ControllerError> {
        let Some(seen) = self.lock().resync.take() else {
            return Ok(());
        };

        let stale: Vec<(PodKey, MirroredPod)> = self
            .lock()
            .known
            .iter()
            .filter(|(key, _)| !seen.contains(*key))
            .map(|(key, pod)| (key.clone(), pod.clone()))
            .collect();
        for (key, pod) in stale {
            info!("Pod {}/{} disappeared while not watching", key.0, key.1);
            self.withdraw(&key)?;
            if pod.node == self.node_name {
                self.release(&key, &pod.uid).await;
            }
        }

        let claimed: HashSet<Ipv4Addr> = self.lock().known.values().map(|p| p.ip).collect();
        for (ip, node_ip) in self.maps.cluster_pods()? {
            if !claimed.contains(&ip) {
                debug!("Deleting orphaned cluster_pod_ips entry {} -> {}", ip, node_ip);
                self.maps.delete_cluster_pod(ip)?;
            }
        }
        Ok(())
    }
}
