//! In-memory [`NetworkOps`] that models namespaces, links and tc hooks.

use super::{Direction, LinkInfo, NamespaceFn, NetworkOps, Route};
use crate::error::NetError;
use dataplane::MacAddr;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct Link {
    info: LinkInfo,
    peer: Option<String>,
    addresses: Vec<Ipv4Addr>,
}

#[derive(Debug, Default)]
struct Namespace {
    links: BTreeMap<String, Link>,
    routes: Vec<Route>,
    neighbors: BTreeMap<(String, Ipv4Addr), MacAddr>,
    clsact: BTreeSet<String>,
    filters: BTreeMap<(String, Direction), Vec<PathBuf>>,
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeMap<Option<PathBuf>, Namespace>,
    next_index: u32,
    creations: usize,
    fail_on: Option<&'static str>,
}

impl State {
    fn allocate_link(&mut self, name: &str) -> LinkInfo {
        self.next_index += 1;
        let [_, _, hi, lo] = self.next_index.to_be_bytes();
        LinkInfo {
            name: name.to_string(),
            index: self.next_index,
            mac: MacAddr([0x02, 0, 0, 0, hi, lo]),
            up: false,
        }
    }
}

/// Fake network for orchestrator tests.
///
/// Clones share state. The host namespace always exists; pod namespaces
/// are registered with [`RecordingNetwork::add_namespace`].
#[derive(Debug, Clone)]
pub struct RecordingNetwork {
    state: Arc<Mutex<State>>,
    current: Option<PathBuf>,
}

impl Default for RecordingNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn command_err(op: &str, reason: &str) -> NetError {
    NetError::Command {
        cmd: op.to_string(),
        status: 2,
        stderr: reason.to_string(),
    }
}

impl RecordingNetwork {
    /// Network with an empty host namespace.
    pub fn new() -> Self {
        let mut state = State::default();
        state.namespaces.insert(None, Namespace::default());
        Self {
            state: Arc::new(Mutex::new(state)),
            current: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers an empty pod namespace.
    pub fn add_namespace(&self, path: impl Into<PathBuf>) {
        self.lock().namespaces.insert(Some(path.into()), Namespace::default());
    }

    /// Makes every later call of `op` fail.
    pub fn fail_on(&self, op: &'static str) {
        self.lock().fail_on = Some(op);
    }

    /// Number of links, qdiscs and filters created so far.
    pub fn creations(&self) -> usize {
        self.lock().creations
    }

    /// Link in `netns` (`None` for the host).
    pub fn link_in(&self, netns: Option<&Path>, name: &str) -> Option<LinkInfo> {
        let state = self.lock();
        state
            .namespaces
            .get(&netns.map(Path::to_path_buf))
            .and_then(|ns| ns.links.get(name))
            .map(|l| l.info.clone())
    }

    /// Addresses of a link in `netns`.
    pub fn addresses_in(&self, netns: Option<&Path>, name: &str) -> Vec<Ipv4Addr> {
        let state = self.lock();
        state
            .namespaces
            .get(&netns.map(Path::to_path_buf))
            .and_then(|ns| ns.links.get(name))
            .map(|l| l.addresses.clone())
            .unwrap_or_default()
    }

    /// Routes installed in `netns`.
    pub fn routes_in(&self, netns: Option<&Path>) -> Vec<Route> {
        let state = self.lock();
        state
            .namespaces
            .get(&netns.map(Path::to_path_buf))
            .map(|ns| ns.routes.clone())
            .unwrap_or_default()
    }

    /// Neighbor entry for `addr` on `dev` in `netns`.
    pub fn neighbor_in(&self, netns: Option<&Path>, dev: &str, addr: Ipv4Addr) -> Option<MacAddr> {
        let state = self.lock();
        state
            .namespaces
            .get(&netns.map(Path::to_path_buf))
            .and_then(|ns| ns.neighbors.get(&(dev.to_string(), addr)).copied())
    }

    /// Objects attached to a host device hook, in attach order.
    pub fn filters(&self, dev: &str, direction: Direction) -> Vec<PathBuf> {
        let state = self.lock();
        state
            .namespaces
            .get(&None)
            .and_then(|ns| ns.filters.get(&(dev.to_string(), direction)).cloned())
            .unwrap_or_default()
    }

    fn with_ns<T>(&self, op: &'static str, f: impl FnOnce(&mut State) -> Result<T, NetError>) -> Result<T, NetError> {
        let mut state = self.lock();
        if state.fail_on == Some(op) {
            return Err(command_err(op, "injected failure"));
        }
        if !state.namespaces.contains_key(&self.current) {
            return Err(NetError::Namespace {
                path: self.current.clone().unwrap_or_default(),
                reason: "namespace is gone".to_string(),
            });
        }
        f(&mut state)
    }

    fn ns<'a>(&self, state: &'a mut State) -> &'a mut Namespace {
        state.namespaces.entry(self.current.clone()).or_default()
    }

    fn link_mut<'a>(&self, state: &'a mut State, name: &str) -> Result<&'a mut Link, NetError> {
        self.ns(state)
            .links
            .get_mut(name)
            .ok_or_else(|| NetError::LinkNotFound(name.to_string()))
    }
}

impl NetworkOps for RecordingNetwork {
    fn link(&self, name: &str) -> Result<Option<LinkInfo>, NetError> {
        self.with_ns("link", |state| Ok(self.ns(state).links.get(name).map(|l| l.info.clone())))
    }

    fn create_veth_pair(&self, name: &str, peer: &str, _mtu: u32) -> Result<(), NetError> {
        self.with_ns("create_veth_pair", |state| {
            let ns = self.ns(state);
            if ns.links.contains_key(name) || ns.links.contains_key(peer) {
                return Err(command_err("ip link add", "File exists"));
            }
            let (a, b) = (state.allocate_link(name), state.allocate_link(peer));
            let ns = self.ns(state);
            ns.links.insert(
                name.to_string(),
                Link {
                    info: a,
                    peer: Some(peer.to_string()),
                    addresses: Vec::new(),
                },
            );
            ns.links.insert(
                peer.to_string(),
                Link {
                    info: b,
                    peer: Some(name.to_string()),
                    addresses: Vec::new(),
                },
            );
            state.creations += 2;
            Ok(())
        })
    }

    fn create_vxlan(&self, name: &str) -> Result<(), NetError> {
        self.with_ns("create_vxlan", |state| {
            if self.ns(state).links.contains_key(name) {
                return Err(command_err("ip link add", "File exists"));
            }
            let info = state.allocate_link(name);
            self.ns(state).links.insert(
                name.to_string(),
                Link {
                    info,
                    peer: None,
                    addresses: Vec::new(),
                },
            );
            state.creations += 1;
            Ok(())
        })
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetError> {
        self.with_ns("set_link_up", |state| {
            self.link_mut(state, name)?.info.up = true;
            Ok(())
        })
    }

    fn move_link_to_host(&self, name: &str) -> Result<(), NetError> {
        self.with_ns("move_link_to_host", |state| {
            if state.namespaces.get(&None).is_some_and(|host| host.links.contains_key(name)) {
                return Err(command_err("ip link set netns", "File exists"));
            }
            let mut link = self
                .ns(state)
                .links
                .remove(name)
                .ok_or_else(|| NetError::LinkNotFound(name.to_string()))?;
            let host = state.namespaces.entry(None).or_default();
            // Moving a link resets it and may renumber it.
            link.info.up = false;
            link.info.index += 1000;
            host.links.insert(name.to_string(), link);
            Ok(())
        })
    }

    fn addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>, NetError> {
        self.with_ns("addresses", |state| Ok(self.link_mut(state, name)?.addresses.clone()))
    }

    fn add_address(&self, name: &str, addr: Ipv4Addr, _prefix_len: u8) -> Result<(), NetError> {
        self.with_ns("add_address", |state| {
            let link = self.link_mut(state, name)?;
            if !link.addresses.contains(&addr) {
                link.addresses.push(addr);
            }
            Ok(())
        })
    }

    fn replace_route(&self, route: &Route) -> Result<(), NetError> {
        self.with_ns("replace_route", |state| {
            self.link_mut(state, &route.dev)?;
            let routes = &mut self.ns(state).routes;
            routes.retain(|r| !(r.dst == route.dst && r.prefix_len == route.prefix_len));
            routes.push(route.clone());
            Ok(())
        })
    }

    fn replace_neighbor(&self, dev: &str, addr: Ipv4Addr, mac: MacAddr) -> Result<(), NetError> {
        self.with_ns("replace_neighbor", |state| {
            self.link_mut(state, dev)?;
            self.ns(state).neighbors.insert((dev.to_string(), addr), mac);
            Ok(())
        })
    }

    fn ensure_clsact(&self, dev: &str) -> Result<(), NetError> {
        self.with_ns("ensure_clsact", |state| {
            self.link_mut(state, dev)?;
            if self.ns(state).clsact.insert(dev.to_string()) {
                state.creations += 1;
            }
            Ok(())
        })
    }

    fn has_filter(&self, dev: &str, direction: Direction) -> Result<bool, NetError> {
        self.with_ns("has_filter", |state| {
            let ns = self.ns(state);
            Ok(ns.filters.get(&(dev.to_string(), direction)).is_some_and(|f| !f.is_empty()))
        })
    }

    fn attach_filter(&self, dev: &str, direction: Direction, object: &Path) -> Result<(), NetError> {
        self.with_ns("attach_filter", |state| {
            let ns = self.ns(state);
            if !ns.clsact.contains(dev) {
                return Err(command_err("tc filter add", "Cannot find specified qdisc on specified device"));
            }
            ns.filters
                .entry((dev.to_string(), direction))
                .or_default()
                .push(object.to_path_buf());
            state.creations += 1;
            Ok(())
        })
    }

    fn delete_link(&self, name: &str) -> Result<bool, NetError> {
        self.with_ns("delete_link", |state| {
            let Some(link) = self.ns(state).links.remove(name) else {
                return Ok(false);
            };
            let ns = self.ns(state);
            ns.clsact.remove(name);
            ns.filters.retain(|(dev, _), _| dev != name);
            ns.neighbors.retain(|(dev, _), _| dev != name);
            ns.routes.retain(|r| r.dev != name);
            // Deleting one end of a veth pair removes the other wherever it is.
            if let Some(peer) = link.peer {
                for other in state.namespaces.values_mut() {
                    if other.links.get(&peer).is_some_and(|l| l.peer.as_deref() == Some(name)) {
                        other.links.remove(&peer);
                        other.routes.retain(|r| r.dev != peer);
                    }
                }
            }
            Ok(true)
        })
    }

    fn in_namespace(&self, netns: &Path, f: &mut NamespaceFn<'_>) -> Result<(), NetError> {
        if !self.lock().namespaces.contains_key(&Some(netns.to_path_buf())) {
            return Err(NetError::Namespace {
                path: netns.to_path_buf(),
                reason: "No such file or directory".to_string(),
            });
        }
        let inner = RecordingNetwork {
            state: Arc::clone(&self.state),
            current: Some(netns.to_path_buf()),
        };
        f(&inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_veth_pair_move_and_delete() {
        let net = RecordingNetwork::new();
        let netns = PathBuf::from("/var/run/netns/a");
        net.add_namespace(&netns);

        net.in_namespace(&netns, &mut |ns| {
            ns.create_veth_pair("eth0", "pn00000001", 1450)?;
            ns.move_link_to_host("pn00000001")
        })
        .unwrap();

        assert!(net.link_in(Some(&netns), "eth0").is_some());
        assert!(net.link_in(None, "pn00000001").is_some());
        assert!(net.link_in(Some(&netns), "pn00000001").is_none());

        assert!(net.delete_link("pn00000001").unwrap());
        assert!(net.link_in(Some(&netns), "eth0").is_none());
        assert!(!net.delete_link("pn00000001").unwrap());
    }

    #[test]
    fn test_unknown_namespace() {
        let net = RecordingNetwork::new();
        let err = net
            .in_namespace(Path::new("/proc/1/ns/missing"), &mut |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, NetError::Namespace { .. }));
    }

    #[test]
    fn test_filter_requires_clsact() {
        let net = RecordingNetwork::new();
        net.create_vxlan("podnet-vxlan").unwrap();
        assert!(
            net.attach_filter("podnet-vxlan", Direction::Ingress, Path::new("/x.o"))
                .is_err()
        );
        net.ensure_clsact("podnet-vxlan").unwrap();
        net.ensure_clsact("podnet-vxlan").unwrap();
        net.attach_filter("podnet-vxlan", Direction::Ingress, Path::new("/x.o"))
            .unwrap();
        assert!(net.has_filter("podnet-vxlan", Direction::Ingress).unwrap());
        assert!(!net.has_filter("podnet-vxlan", Direction::Egress).unwrap());
        // link + qdisc + filter
        assert_eq!(net.creations(), 3);
    }
}
