//! iproute2 backed [`NetworkOps`].

use super::{Direction, LinkInfo, NamespaceFn, NetworkOps, Route};
use crate::error::NetError;
use dataplane::MacAddr;
use nix::sched::{CloneFlags, setns};
use serde::Deserialize;
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;
use tracing::{debug, trace};

/// Runs `ip` and `tc` in the namespace of the calling thread.
#[derive(Debug, Clone)]
pub struct LinuxNetwork {
    ip_path: String,
    tc_path: String,
}

impl Default for LinuxNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct IpAddrLink {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    local: String,
}

fn parse_links(cmd: &str, out: &str) -> Result<Vec<LinkInfo>, NetError> {
    let links: Vec<IpLink> = serde_json::from_str(out).map_err(|e| NetError::Parse {
        cmd: cmd.to_string(),
        reason: e.to_string(),
    })?;
    Ok(links
        .into_iter()
        .map(|l| LinkInfo {
            mac: l.address.and_then(|a| a.parse().ok()).unwrap_or_default(),
            up: l.flags.iter().any(|f| f == "UP"),
            name: l.ifname,
            index: l.ifindex,
        })
        .collect())
}

fn parse_addresses(cmd: &str, out: &str) -> Result<Vec<Ipv4Addr>, NetError> {
    let links: Vec<IpAddrLink> = serde_json::from_str(out).map_err(|e| NetError::Parse {
        cmd: cmd.to_string(),
        reason: e.to_string(),
    })?;
    links
        .iter()
        .flat_map(|l| l.addr_info.iter())
        .filter(|a| a.family == "inet")
        .map(|a| {
            a.local.parse::<Ipv4Addr>().map_err(|_| NetError::Parse {
                cmd: cmd.to_string(),
                reason: format!("bad address {}", a.local),
            })
        })
        .collect()
}

fn route_args(route: &Route) -> Vec<String> {
    let dst = if route.prefix_len == 0 {
        "default".to_string()
    } else {
        format!("{}/{}", route.dst, route.prefix_len)
    };
    let mut args = vec!["route".to_string(), "replace".to_string(), dst];
    if let Some(via) = route.via {
        args.extend(["via".to_string(), via.to_string()]);
    }
    args.extend(["dev".to_string(), route.dev.clone()]);
    if route.link_scope {
        args.extend(["scope".to_string(), "link".to_string()]);
    }
    args
}

impl LinuxNetwork {
    /// Uses `ip` and `tc` from `PATH`.
    pub fn new() -> Self {
        Self::with_paths("ip", "tc")
    }

    /// Uses explicit tool paths.
    pub fn with_paths(ip_path: impl Into<String>, tc_path: impl Into<String>) -> Self {
        Self {
            ip_path: ip_path.into(),
            tc_path: tc_path.into(),
        }
    }

    fn run<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Result<String, NetError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let cmd = format!("{} {}", program, args.join(" "));
        trace!("Running {}", cmd);

        let output = Command::new(program).args(&args).output()?;
        if !output.status.success() {
            return Err(NetError::Command {
                cmd,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn ip<S: AsRef<str>>(&self, args: &[S]) -> Result<String, NetError> {
        self.run(&self.ip_path, args)
    }

    fn tc<S: AsRef<str>>(&self, args: &[S]) -> Result<String, NetError> {
        self.run(&self.tc_path, args)
    }
}

impl NetworkOps for LinuxNetwork {
    fn link(&self, name: &str) -> Result<Option<LinkInfo>, NetError> {
        match self.ip(&["-j", "link", "show", "dev", name]) {
            Ok(out) => Ok(parse_links("ip -j link show", &out)?.into_iter().next()),
            Err(NetError::Command { stderr, .. }) if stderr.contains("does not exist") => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_veth_pair(&self, name: &str, peer: &str, mtu: u32) -> Result<(), NetError> {
        debug!("Creating veth pair {} <-> {} (mtu {})", name, peer, mtu);
        let mtu = mtu.to_string();
        self.ip(&["link", "add", name, "mtu", &mtu, "type", "veth", "peer", "name", peer, "mtu", &mtu])?;
        Ok(())
    }

    fn create_vxlan(&self, name: &str) -> Result<(), NetError> {
        debug!("Creating vxlan device {}", name);
        self.ip(&["link", "add", "name", name, "type", "vxlan", "external"])?;
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetError> {
        self.ip(&["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn move_link_to_host(&self, name: &str) -> Result<(), NetError> {
        // Only the worker thread switched namespace; the process still
        // names the host namespace.
        let pid = std::process::id().to_string();
        self.ip(&["link", "set", "dev", name, "netns", &pid])?;
        Ok(())
    }

    fn addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>, NetError> {
        let out = self.ip(&["-j", "-4", "addr", "show", "dev", name])?;
        parse_addresses("ip -j -4 addr show", &out)
    }

    fn add_address(&self, name: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<(), NetError> {
        let cidr = format!("{}/{}", addr, prefix_len);
        self.ip(&["addr", "replace", &cidr, "dev", name])?;
        Ok(())
    }

    fn replace_route(&self, route: &Route) -> Result<(), NetError> {
        self.ip(route_args(route).as_slice())?;
        Ok(())
    }

    fn replace_neighbor(&self, dev: &str, addr: Ipv4Addr, mac: MacAddr) -> Result<(), NetError> {
        let (addr, mac) = (addr.to_string(), mac.to_string());
        self.ip(&["neigh", "replace", &addr, "lladdr", &mac, "dev", dev, "nud", "permanent"])?;
        Ok(())
    }

    fn ensure_clsact(&self, dev: &str) -> Result<(), NetError> {
        let qdiscs = self.tc(&["qdisc", "show", "dev", dev])?;
        if qdiscs.lines().any(|l| l.starts_with("qdisc clsact")) {
            return Ok(());
        }
        self.tc(&["qdisc", "add", "dev", dev, "clsact"])?;
        Ok(())
    }

    fn has_filter(&self, dev: &str, direction: Direction) -> Result<bool, NetError> {
        let direction = direction.to_string();
        let filters = self.tc(&["filter", "show", "dev", dev, &direction])?;
        Ok(!filters.trim().is_empty())
    }

    fn attach_filter(&self, dev: &str, direction: Direction, object: &Path) -> Result<(), NetError> {
        let direction = direction.to_string();
        let object = object.to_string_lossy();
        self.tc(&["filter", "add", "dev", dev, &direction, "bpf", "direct-action", "obj", &object])?;
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<bool, NetError> {
        if self.link(name)?.is_none() {
            return Ok(false);
        }
        self.ip(&["link", "del", "dev", name])?;
        Ok(true)
    }

    fn in_namespace(&self, netns: &Path, f: &mut NamespaceFn<'_>) -> Result<(), NetError> {
        let namespace_err = |reason: String| NetError::Namespace {
            path: netns.to_path_buf(),
            reason,
        };
        // A throwaway thread enters the namespace so no pooled thread is
        // ever left inside it.
        std::thread::scope(|scope| {
            let worker = scope.spawn(move || -> Result<(), NetError> {
                let handle = File::open(netns).map_err(|e| namespace_err(e.to_string()))?;
                setns(&handle, CloneFlags::CLONE_NEWNET).map_err(|e| namespace_err(e.to_string()))?;
                f(self)
            });
            worker
                .join()
                .unwrap_or_else(|_| Err(namespace_err("namespace worker panicked".to_string())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_links() {
        let out = r#"[{"ifindex":7,"ifname":"pn1a2b3c4d","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],
            "mtu":1450,"link_type":"ether","address":"8a:3e:01:02:03:04"}]"#;
        let links = parse_links("ip", out).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].index, 7);
        assert_eq!(links[0].name, "pn1a2b3c4d");
        assert_eq!(links[0].mac.to_string(), "8a:3e:01:02:03:04");
        assert!(links[0].up);
    }

    #[test]
    fn test_parse_links_without_mac() {
        let out = r#"[{"ifindex":1,"ifname":"lo","flags":["LOOPBACK"]}]"#;
        let links = parse_links("ip", out).unwrap();
        assert_eq!(links[0].mac, MacAddr::default());
        assert!(!links[0].up);
    }

    #[test]
    fn test_parse_addresses() {
        let out = r#"[{"ifindex":3,"ifname":"veth_host","addr_info":[
            {"family":"inet","local":"169.254.1.1","prefixlen":32},
            {"family":"inet6","local":"fe80::1","prefixlen":64}]}]"#;
        assert_eq!(parse_addresses("ip", out).unwrap(), vec![Ipv4Addr::new(169, 254, 1, 1)]);
        assert!(parse_addresses("ip", "{").is_err());
    }

    #[test]
    fn test_route_args() {
        let host = Route {
            dst: Ipv4Addr::new(169, 254, 1, 1),
            prefix_len: 32,
            via: None,
            dev: "eth0".to_string(),
            link_scope: true,
        };
        assert_eq!(route_args(&host).join(" "), "route replace 169.254.1.1/32 dev eth0 scope link");

        let default = Route {
            dst: Ipv4Addr::UNSPECIFIED,
            prefix_len: 0,
            via: Some(Ipv4Addr::new(169, 254, 1, 1)),
            dev: "eth0".to_string(),
            link_scope: false,
        };
        assert_eq!(route_args(&default).join(" "), "route replace default via 169.254.1.1 dev eth0");
    }
}
