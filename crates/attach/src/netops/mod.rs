//! Link, address, route, neighbor and tc operations.
//!
//! [`NetworkOps`] is the seam between the orchestrator and the kernel.
//! [`LinuxNetwork`] drives iproute2 and enters namespaces with `setns(2)`;
//! tests use the in-memory `RecordingNetwork`.

mod linux;
#[cfg(any(test, feature = "test-util"))]
mod recording;

pub use linux::LinuxNetwork;
#[cfg(any(test, feature = "test-util"))]
pub use recording::RecordingNetwork;

use crate::error::NetError;
use dataplane::MacAddr;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

/// A network interface as seen in the current namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Interface name
    pub name: String,
    /// Interface index
    pub index: u32,
    /// Hardware address
    pub mac: MacAddr,
    /// Administratively up
    pub up: bool,
}

/// A route installed on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network address
    pub dst: Ipv4Addr,
    /// Destination prefix length
    pub prefix_len: u8,
    /// Next hop, `None` for directly connected destinations
    pub via: Option<Ipv4Addr>,
    /// Output device
    pub dev: String,
    /// Link scope instead of universe scope
    pub link_scope: bool,
}

/// tc hook a filter is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Packets received by the device
    Ingress,
    /// Packets sent by the device
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => f.write_str("ingress"),
            Direction::Egress => f.write_str("egress"),
        }
    }
}

/// Closure run inside another network namespace.
pub type NamespaceFn<'a> = dyn FnMut(&dyn NetworkOps) -> Result<(), NetError> + Send + 'a;

/// Operations on the network namespace the implementation is bound to.
pub trait NetworkOps: Send + Sync {
    /// Looks up a link by name.
    fn link(&self, name: &str) -> Result<Option<LinkInfo>, NetError>;

    /// Creates a veth pair with both ends in this namespace.
    fn create_veth_pair(&self, name: &str, peer: &str, mtu: u32) -> Result<(), NetError>;

    /// Creates a collect-metadata VXLAN device.
    fn create_vxlan(&self, name: &str) -> Result<(), NetError>;

    /// Brings a link up.
    fn set_link_up(&self, name: &str) -> Result<(), NetError>;

    /// Moves a link into the namespace of the calling process.
    fn move_link_to_host(&self, name: &str) -> Result<(), NetError>;

    /// IPv4 addresses assigned to a link.
    fn addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>, NetError>;

    /// Assigns an address, replacing an identical one.
    fn add_address(&self, name: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<(), NetError>;

    /// Installs or replaces a route.
    fn replace_route(&self, route: &Route) -> Result<(), NetError>;

    /// Installs or replaces a permanent neighbor entry.
    fn replace_neighbor(&self, dev: &str, addr: Ipv4Addr, mac: MacAddr) -> Result<(), NetError>;

    /// Adds a `clsact` qdisc unless the device already has one.
    fn ensure_clsact(&self, dev: &str) -> Result<(), NetError>;

    /// Whether any filter is attached to the hook.
    fn has_filter(&self, dev: &str, direction: Direction) -> Result<bool, NetError>;

    /// Attaches a direct-action BPF object to the hook.
    fn attach_filter(&self, dev: &str, direction: Direction, object: &Path) -> Result<(), NetError>;

    /// Deletes a link; `false` when it did not exist.
    fn delete_link(&self, name: &str) -> Result<bool, NetError>;

    /// Runs `f` with operations bound to the namespace at `netns`.
    ///
    /// The calling thread never changes namespace.
    fn in_namespace(&self, netns: &Path, f: &mut NamespaceFn<'_>) -> Result<(), NetError>;
}
