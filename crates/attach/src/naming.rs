//! Interface names shared by attach and detach.

/// Host-facing member of the node gateway pair.
pub const GATEWAY_HOST_LINK: &str = "veth_host";
/// Peer of [`GATEWAY_HOST_LINK`].
pub const GATEWAY_NET_LINK: &str = "veth_net";
/// MTU of the gateway pair.
pub const GATEWAY_LINK_MTU: u32 = 1500;
/// Prefix of host-side pod peers.
pub const HOST_VETH_PREFIX: &str = "pn";

/// Program attached to the ingress of host-side pod peers.
pub const VETH_INGRESS_PROGRAM: &str = "veth_ingress.o";
/// Program attached to the ingress of the overlay tunnel.
pub const TUNNEL_INGRESS_PROGRAM: &str = "vxlan_ingress.o";
/// Program attached to the egress of the overlay tunnel.
pub const TUNNEL_EGRESS_PROGRAM: &str = "vxlan_egress.o";

/// Name of the host-side peer for a pod.
///
/// Derived from the pod identity only, so a repeated ADD finds the peer a
/// previous ADD created. Always 10 characters, well under `IFNAMSIZ`.
pub fn host_veth_name(namespace: &str, name: &str) -> String {
    let key = format!("{}/{}", namespace, name);
    format!("{}{:08x}", HOST_VETH_PREFIX, fnv1a32(key.as_bytes()))
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5, |hash: u32, b| (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a32_reference_values() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn test_host_veth_name_is_stable_and_short() {
        let first = host_veth_name("default", "web-0");
        assert_eq!(first, host_veth_name("default", "web-0"));
        assert!(first.starts_with(HOST_VETH_PREFIX));
        assert_eq!(first.len(), 10);
    }

    #[test]
    fn test_host_veth_name_depends_on_namespace() {
        assert_ne!(host_veth_name("default", "web-0"), host_veth_name("prod", "web-0"));
        assert_ne!(host_veth_name("default", "web-0"), host_veth_name("default", "web-1"));
    }
}
