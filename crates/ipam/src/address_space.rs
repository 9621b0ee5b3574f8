//! Address specifications and the ordered address universe.
//!
//! A pool lists single addresses and inclusive ranges. The universe a pool
//! expands to is ordered: single addresses first in the order they were
//! declared, then ranges sorted by their first address, each walked upwards.
//! Allocation always takes the first free address of that order, so the order
//! decides which address a pool hands out next.

use crate::error::IpamError;
use crds::IPPool;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// One entry of a pool's address list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEntry {
    /// `"10.244.0.5"`
    Single(Ipv4Addr),
    /// `"10.244.0.10-10.244.0.20"`, both ends included
    Range(Ipv4Addr, Ipv4Addr),
}

impl AddressEntry {
    /// Number of addresses the entry covers.
    pub fn len(&self) -> u64 {
        match self {
            AddressEntry::Single(_) => 1,
            AddressEntry::Range(start, end) => u64::from(u32::from(*end)) - u64::from(u32::from(*start)) + 1,
        }
    }

    /// Whether `ip` is covered by the entry.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        match self {
            AddressEntry::Single(a) => *a == ip,
            AddressEntry::Range(start, end) => (*start..=*end).contains(&ip),
        }
    }
}

impl FromStr for AddressEntry {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<Ipv4Addr>()
                .map_err(|e| IpamError::InvalidAddressSpec(format!("{}: {}", s, e)))
        };

        match s.split_once('-') {
            None => Ok(AddressEntry::Single(parse(s)?)),
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(IpamError::InvalidAddressSpec(format!(
                        "{}: range start is after range end",
                        s
                    )));
                }
                Ok(AddressEntry::Range(start, end))
            }
        }
    }
}

/// Parsed address list of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSpace {
    entries: Vec<AddressEntry>,
}

impl AddressSpace {
    /// Parses every entry of a pool's address list.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self, IpamError> {
        let entries = specs
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    /// Parsed entries in declaration order.
    pub fn entries(&self) -> &[AddressEntry] {
        &self.entries
    }

    /// Whether `ip` lies inside the address space.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.entries.iter().any(|e| e.contains(ip))
    }

    /// Expands the address space into its ordered universe.
    ///
    /// Addresses covered by more than one entry appear once, at their first
    /// position.
    pub fn universe(&self) -> Vec<Ipv4Addr> {
        let mut ranges: Vec<(Ipv4Addr, Ipv4Addr)> = self
            .entries
            .iter()
            .filter_map(|e| match e {
                AddressEntry::Range(start, end) => Some((*start, *end)),
                AddressEntry::Single(_) => None,
            })
            .collect();
        ranges.sort_by_key(|(start, _)| *start);

        let singles = self.entries.iter().filter_map(|e| match e {
            AddressEntry::Single(ip) => Some(*ip),
            AddressEntry::Range(..) => None,
        });
        let expanded = ranges
            .into_iter()
            .flat_map(|(start, end)| (u32::from(start)..=u32::from(end)).map(Ipv4Addr::from));

        let mut seen = HashSet::new();
        singles.chain(expanded).filter(|ip| seen.insert(*ip)).collect()
    }
}

/// Addresses of `universe` that are not in `taken`, in universe order.
pub fn exclude<'a>(
    universe: &'a [Ipv4Addr],
    taken: &'a HashSet<Ipv4Addr>,
) -> impl Iterator<Item = Ipv4Addr> + 'a {
    universe.iter().copied().filter(move |ip| !taken.contains(ip))
}

/// Expanded universes keyed by pool name.
///
/// An entry is reused for as long as the pool's address list is unchanged, so
/// allocations only pay for expanding large ranges once per spec revision.
#[derive(Debug, Default)]
pub struct UniverseCache {
    entries: Mutex<HashMap<String, (Vec<String>, Arc<[Ipv4Addr]>)>>,
}

impl UniverseCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the universe of `pool`, expanding it if its spec changed.
    pub fn universe(&self, pool: &IPPool) -> Result<Arc<[Ipv4Addr]>, IpamError> {
        let name = pool.metadata.name.clone().unwrap_or_default();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some((ips, universe)) = entries.get(&name) {
            if *ips == pool.spec.ips {
                return Ok(Arc::clone(universe));
            }
        }

        let universe: Arc<[Ipv4Addr]> = AddressSpace::parse(&pool.spec.ips)?.universe().into();
        entries.insert(name, (pool.spec.ips.clone(), Arc::clone(&universe)));
        Ok(universe)
    }
}
