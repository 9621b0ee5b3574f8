//! Pod helpers: liveness, pool selection and owner identity.

use crds::{DEFAULT_POOL, POOL_ANNOTATION, PodOwner};
use k8s_openapi::api::core::v1::Pod;

/// Whether a pod still needs its address.
///
/// A pod is considered gone once it is being deleted, once it succeeded and
/// will not be restarted, or once it failed for good (restart policy `Never`,
/// or evicted).
pub fn is_pod_alive(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }

    let restart_policy = pod
        .spec
        .as_ref()
        .and_then(|s| s.restart_policy.as_deref())
        .unwrap_or("Always");
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or_default();
    let reason = status.and_then(|s| s.reason.as_deref()).unwrap_or_default();

    match phase {
        "Succeeded" => restart_policy == "Always",
        "Failed" => restart_policy != "Never" && reason != "Evicted",
        _ => true,
    }
}

/// Pool named by the pod's annotation, or the default pool.
pub fn pool_for_pod(pod: &Pod) -> &str {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(POOL_ANNOTATION))
        .map(String::as_str)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_POOL)
}

/// Owner identity of a pod, if it has namespace, name and UID.
pub fn pod_owner(pod: &Pod) -> Option<PodOwner> {
    Some(PodOwner::new(
        pod.metadata.namespace.clone()?,
        pod.metadata.name.clone()?,
        pod.metadata.uid.clone()?,
    ))
}
