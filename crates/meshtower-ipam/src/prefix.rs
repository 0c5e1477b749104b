//! A single CIDR block and the addresses allocated out of it

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{AllocationError, Result};

/// Parse a CIDR string and normalize it to its network address
///
/// `192.168.1.5/24` becomes `192.168.1.0/24`. A bare address without a
/// prefix length is rejected.
///
/// # Example
/// ```
/// use meshtower_ipam::prefix::parse_cidr;
///
/// let net = parse_cidr("192.168.1.5/24").unwrap();
/// assert_eq!(net.to_string(), "192.168.1.0/24");
/// ```
pub fn parse_cidr(cidr: &str) -> Result<IpNet> {
    let net: IpNet = cidr
        .trim()
        .parse()
        .map_err(|e| AllocationError::InvalidCidr(format!("{}: {}", cidr, e)))?;
    Ok(net.trunc())
}

/// A CIDR block in the allocator forest
///
/// A prefix owns the set of addresses handed out directly from it. Child
/// prefixes are referenced by CIDR only; the forest is the owning collection
/// and the child keeps a CIDR back-reference to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    cidr: IpNet,
    parent: Option<IpNet>,
    /// Holder of a delegated prefix
    owner: Option<String>,
    children: BTreeSet<IpNet>,
    /// Allocated address -> owner
    allocations: BTreeMap<IpAddr, String>,
}

/// Capacity figures for a prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Assignable addresses (network and broadcast excluded)
    pub capacity: u128,
    /// Addresses held directly by this prefix
    pub allocated: u128,
    /// Assignable addresses handed to child prefixes
    pub delegated: u128,
    /// Addresses still available for first-fit acquisition
    pub available: u128,
}

impl Prefix {
    pub(crate) fn new(cidr: IpNet, parent: Option<IpNet>) -> Self {
        Self {
            cidr,
            parent,
            owner: None,
            children: BTreeSet::new(),
            allocations: BTreeMap::new(),
        }
    }

    /// Canonical CIDR of this prefix
    pub fn cidr(&self) -> IpNet {
        self.cidr
    }

    /// CIDR of the parent prefix, if this is a child
    pub fn parent(&self) -> Option<IpNet> {
        self.parent
    }

    /// Owner the prefix is delegated to, if any
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Whether this prefix is a forest root
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// CIDRs of the prefixes carved out of this one
    pub fn children(&self) -> impl Iterator<Item = &IpNet> {
        self.children.iter()
    }

    /// Allocated addresses with their owners, in address order
    pub fn allocations(&self) -> impl Iterator<Item = (IpAddr, &str)> {
        self.allocations.iter().map(|(ip, owner)| (*ip, owner.as_str()))
    }

    /// Owner holding `ip`, if it is allocated from this prefix
    pub fn owner_of(&self, ip: IpAddr) -> Option<&str> {
        self.allocations.get(&ip).map(String::as_str)
    }

    /// First address held by `owner`, if any
    pub fn address_of(&self, owner: &str) -> Option<IpAddr> {
        self.allocations
            .iter()
            .find(|(_, holder)| holder.as_str() == owner)
            .map(|(ip, _)| *ip)
    }

    pub fn is_allocated(&self, ip: IpAddr) -> bool {
        self.allocations.contains_key(&ip)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocations.len()
    }

    /// Whether `ip` lies anywhere inside the CIDR range
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.cidr.contains(&ip)
    }

    /// Whether `ip` can be handed out by this prefix at all
    ///
    /// Network and broadcast addresses are reserved unless the prefix is a
    /// point-to-point (/31, /127) or host (/32, /128) block.
    pub fn is_assignable(&self, ip: IpAddr) -> bool {
        match self.usable_range() {
            Some((first, last)) => {
                self.contains(ip) && (first..=last).contains(&addr_to_u128(ip))
            }
            None => false,
        }
    }

    /// Child prefix covering `ip`, if any
    pub fn child_covering(&self, ip: IpAddr) -> Option<IpNet> {
        self.children.iter().find(|child| child.contains(&ip)).copied()
    }

    /// Capacity figures for this prefix
    pub fn usage(&self) -> Usage {
        let capacity = match self.usable_range() {
            Some((first, last)) => (last - first).saturating_add(1),
            None => 0,
        };
        let delegated = self
            .children
            .iter()
            .map(|child| self.assignable_within(child))
            .fold(0u128, u128::saturating_add);
        let allocated = self.allocations.len() as u128;

        Usage {
            capacity,
            allocated,
            delegated,
            available: capacity.saturating_sub(allocated).saturating_sub(delegated),
        }
    }

    /// Lowest free assignable address, skipping child ranges
    pub(crate) fn next_free(&self) -> Option<IpAddr> {
        let (first, last) = self.usable_range()?;
        let family = self.cidr.network();
        let mut cursor = first;

        while cursor <= last {
            let ip = u128_to_addr(cursor, family);

            if let Some(child) = self.child_covering(ip) {
                cursor = addr_to_u128(child.broadcast()).checked_add(1)?;
                continue;
            }
            if self.allocations.contains_key(&ip) {
                cursor = cursor.checked_add(1)?;
                continue;
            }
            return Some(ip);
        }
        None
    }

    pub(crate) fn insert(&mut self, ip: IpAddr, owner: &str) {
        self.allocations.insert(ip, owner.to_string());
    }

    pub(crate) fn remove(&mut self, ip: IpAddr) -> bool {
        self.allocations.remove(&ip).is_some()
    }

    pub(crate) fn set_owner(&mut self, owner: Option<&str>) {
        self.owner = owner.map(str::to_string);
    }

    pub(crate) fn add_child(&mut self, child: IpNet) {
        self.children.insert(child);
    }

    pub(crate) fn remove_child(&mut self, child: &IpNet) {
        self.children.remove(child);
    }

    /// First allocated address that falls inside `range`
    pub(crate) fn allocation_within(&self, range: &IpNet) -> Option<IpAddr> {
        self.allocations.keys().find(|ip| range.contains(*ip)).copied()
    }

    /// Inclusive numeric bounds of the assignable addresses
    fn usable_range(&self) -> Option<(u128, u128)> {
        let network = addr_to_u128(self.cidr.network());
        let broadcast = addr_to_u128(self.cidr.broadcast());

        if self.cidr.prefix_len() + 1 >= self.cidr.max_prefix_len() {
            return Some((network, broadcast));
        }
        if broadcast - network < 2 {
            return None;
        }
        Some((network + 1, broadcast - 1))
    }

    fn assignable_within(&self, child: &IpNet) -> u128 {
        let Some((first, last)) = self.usable_range() else {
            return 0;
        };
        let lo = addr_to_u128(child.network()).max(first);
        let hi = addr_to_u128(child.broadcast()).min(last);
        if lo > hi {
            0
        } else {
            (hi - lo).saturating_add(1)
        }
    }
}

pub(crate) fn addr_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Build an address of the same family as `family` from its numeric value
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn u128_to_addr(value: u128, family: IpAddr) -> IpAddr {
    match family {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// Whether two CIDR ranges share at least one address
pub(crate) fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}
