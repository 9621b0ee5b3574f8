//! Fixed-layout map records.
//!
//! IPv4 addresses are stored as the host-order `u32` of the address in native
//! byte order, which is what the programs compare against after converting
//! the packet's address with `bpf_htonl`. Interface indices are native `u32`.

use crate::error::DataplaneError;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Pin name of the local device map.
pub const LOCAL_DEV_MAP: &str = "local_dev";
/// Pin name of the local pod map.
pub const LOCAL_POD_IPS_MAP: &str = "local_pod_ips";
/// Pin name of the cluster pod map.
pub const CLUSTER_POD_IPS_MAP: &str = "cluster_pod_ips";

/// Size of every `u32` key and value.
pub const WORD_SIZE: usize = 4;
/// Size of a [`LocalPodValue`].
pub const LOCAL_POD_VALUE_SIZE: usize = 24;

/// Singleton devices published in `local_dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceRole {
    /// The VXLAN overlay device
    OverlayTunnel = 1,
    /// The host side of the gateway veth pair
    Veth = 2,
}

impl DeviceRole {
    /// Key bytes of the role.
    pub fn to_key(self) -> [u8; WORD_SIZE] {
        (self as u32).to_ne_bytes()
    }

    /// Decodes key bytes.
    pub fn from_key(bytes: [u8; WORD_SIZE]) -> Result<Self, DataplaneError> {
        match u32::from_ne_bytes(bytes) {
            1 => Ok(DeviceRole::OverlayTunnel),
            2 => Ok(DeviceRole::Veth),
            other => Err(DataplaneError::InvalidRecord(format!("unknown device role {}", other))),
        }
    }
}

/// Encodes an IPv4 address as a map key or value.
pub fn ip_to_bytes(ip: Ipv4Addr) -> [u8; WORD_SIZE] {
    u32::from(ip).to_ne_bytes()
}

/// Decodes an IPv4 address from a map key or value.
pub fn ip_from_bytes(bytes: [u8; WORD_SIZE]) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_ne_bytes(bytes))
}

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl FromStr for MacAddr {
    type Err = DataplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(|| DataplaneError::InvalidMac(s.to_string()))?;
            if part.len() != 2 {
                return Err(DataplaneError::InvalidMac(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| DataplaneError::InvalidMac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(DataplaneError::InvalidMac(s.to_string()));
        }
        Ok(MacAddr(bytes))
    }
}

/// Forwarding metadata of a pod attached to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPodValue {
    /// Index of the interface inside the pod namespace
    pub ifindex: u32,
    /// Index of the host-side peer
    pub host_ifindex: u32,
    /// MAC of the interface inside the pod namespace
    pub mac: MacAddr,
    /// MAC of the host-side peer
    pub host_mac: MacAddr,
}

impl LocalPodValue {
    /// Encodes the value; MACs are zero-padded to 8 bytes.
    pub fn to_bytes(&self) -> [u8; LOCAL_POD_VALUE_SIZE] {
        let mut out = [0u8; LOCAL_POD_VALUE_SIZE];
        out[0..4].copy_from_slice(&self.ifindex.to_ne_bytes());
        out[4..8].copy_from_slice(&self.host_ifindex.to_ne_bytes());
        out[8..14].copy_from_slice(&self.mac.0);
        out[16..22].copy_from_slice(&self.host_mac.0);
        out
    }

    /// Decodes a value read from the map.
    pub fn from_bytes(bytes: &[u8; LOCAL_POD_VALUE_SIZE]) -> Self {
        let word = |i: usize| u32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let mac = |i: usize| {
            let mut m = [0u8; 6];
            m.copy_from_slice(&bytes[i..i + 6]);
            MacAddr(m)
        };
        Self {
            ifindex: word(0),
            host_ifindex: word(4),
            mac: mac(8),
            host_mac: mac(16),
        }
    }
}
