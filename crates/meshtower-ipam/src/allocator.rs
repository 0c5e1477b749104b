//! Prefix forest and address allocation
//!
//! [`Ipam`] owns every prefix of one zone (or any other named root) and is
//! the only way to mutate them. It carries no internal locking: callers keep
//! a single writer per forest.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AllocationError, PersistenceError, Result};
use crate::prefix::{overlaps, parse_cidr, Prefix, Usage};

/// Version tag written into every dump
pub const STATE_VERSION: u32 = 1;

/// Hierarchical address allocator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ipam {
    prefixes: BTreeMap<IpNet, Prefix>,
}

/// Serialized form of the whole forest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpamState {
    pub version: u32,
    pub prefixes: Vec<PrefixState>,
}

/// Serialized form of one prefix
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrefixState {
    pub cidr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub allocations: Vec<AllocationState>,
}

/// Serialized form of one held address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocationState {
    pub ip: IpAddr,
    pub owner: String,
}

impl Ipam {
    /// Create an empty allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator with a single root prefix
    ///
    /// # Example
    /// ```
    /// use meshtower_ipam::Ipam;
    ///
    /// let mut ipam = Ipam::with_root("10.200.0.0/24").unwrap();
    /// let ip = ipam.acquire_ip("10.200.0.0/24", "node-a").unwrap();
    /// assert_eq!(ip.to_string(), "10.200.0.1");
    /// ```
    pub fn with_root(cidr: &str) -> Result<Self> {
        let mut ipam = Self::new();
        ipam.create_prefix(cidr)?;
        Ok(ipam)
    }

    /// Add a root prefix to the forest
    ///
    /// The CIDR is normalized to its network address. Roots may not overlap
    /// each other.
    pub fn create_prefix(&mut self, cidr: &str) -> Result<&Prefix> {
        let net = parse_cidr(cidr)?;

        if let Some(existing) = self.roots().find(|root| overlaps(&root.cidr(), &net)) {
            return Err(AllocationError::Overlap {
                requested: net.to_string(),
                existing: existing.cidr().to_string(),
            });
        }

        debug!(cidr = %net, "Created root prefix");
        Ok(&*self.prefixes.entry(net).or_insert_with(|| Prefix::new(net, None)))
    }

    /// Carve a child prefix out of `parent`
    ///
    /// The requested CIDR is normalized, must lie strictly inside the parent,
    /// and must not overlap a sibling or any address the parent has already
    /// handed out.
    pub fn create_child_prefix(&mut self, parent: &str, cidr: &str) -> Result<&Prefix> {
        let parent_net = parse_cidr(parent)?;
        let child_net = parse_cidr(cidr)?;

        let parent_prefix = self
            .prefixes
            .get(&parent_net)
            .ok_or_else(|| AllocationError::UnknownPrefix(parent_net.to_string()))?;

        if child_net == parent_net || !parent_net.contains(&child_net) {
            return Err(AllocationError::InvalidCidr(format!(
                "{} is not contained in {}",
                child_net, parent_net
            )));
        }

        if let Some(sibling) = parent_prefix
            .children()
            .find(|sibling| overlaps(sibling, &child_net))
        {
            return Err(AllocationError::Overlap {
                requested: child_net.to_string(),
                existing: sibling.to_string(),
            });
        }

        if let Some(ip) = parent_prefix.allocation_within(&child_net) {
            return Err(AllocationError::Overlap {
                requested: child_net.to_string(),
                existing: ip.to_string(),
            });
        }

        if let Some(parent_prefix) = self.prefixes.get_mut(&parent_net) {
            parent_prefix.add_child(child_net);
        }

        debug!(parent = %parent_net, cidr = %child_net, "Created child prefix");
        Ok(&*self
            .prefixes
            .entry(child_net)
            .or_insert_with(|| Prefix::new(child_net, Some(parent_net))))
    }

    /// Remove a prefix together with every prefix carved out of it
    pub fn delete_prefix(&mut self, cidr: &str) -> Result<()> {
        let net = parse_cidr(cidr)?;
        let prefix = self
            .prefixes
            .remove(&net)
            .ok_or_else(|| AllocationError::UnknownPrefix(net.to_string()))?;

        if let Some(parent) = prefix.parent().and_then(|p| self.prefixes.get_mut(&p)) {
            parent.remove_child(&net);
        }

        let mut pending: Vec<IpNet> = prefix.children().copied().collect();
        while let Some(child) = pending.pop() {
            if let Some(removed) = self.prefixes.remove(&child) {
                pending.extend(removed.children().copied());
            }
        }

        debug!(cidr = %net, "Deleted prefix");
        Ok(())
    }

    /// Record which owner a prefix is delegated to; `None` clears it
    pub fn set_prefix_owner(&mut self, cidr: &str, owner: Option<&str>) -> Result<()> {
        let prefix = self.prefix_mut(cidr)?;
        prefix.set_owner(owner);
        debug!(cidr = %prefix.cidr(), owner = ?owner, "Set prefix owner");
        Ok(())
    }

    /// Remove every prefix from the forest
    pub fn delete_all_prefixes(&mut self) {
        self.prefixes.clear();
    }

    /// Acquire the lowest free address of `prefix` for `owner`
    ///
    /// Network and broadcast addresses, addresses already held, and ranges
    /// delegated to child prefixes are skipped.
    pub fn acquire_ip(&mut self, prefix: &str, owner: &str) -> Result<IpAddr> {
        let prefix = self.prefix_mut(prefix)?;
        let ip = prefix
            .next_free()
            .ok_or_else(|| AllocationError::Exhausted(prefix.cidr().to_string()))?;

        prefix.insert(ip, owner);
        debug!(prefix = %prefix.cidr(), ip = %ip, owner, "Acquired IP");
        Ok(ip)
    }

    /// Acquire a specific address of `prefix` for `owner`
    ///
    /// Re-requesting an address the same owner already holds releases and
    /// re-acquires it, so it succeeds. An address held by anyone else fails
    /// with [`AllocationError::Conflict`].
    pub fn acquire_specific_ip(&mut self, prefix: &str, ip: IpAddr, owner: &str) -> Result<IpAddr> {
        let prefix = self.prefix_mut(prefix)?;
        let cidr = prefix.cidr().to_string();

        if !prefix.is_assignable(ip) {
            return Err(AllocationError::OutOfRange { ip, prefix: cidr });
        }

        if prefix.child_covering(ip).is_some() {
            return Err(AllocationError::Conflict { ip, prefix: cidr });
        }

        if let Some(holder) = prefix.owner_of(ip) {
            if holder != owner {
                return Err(AllocationError::Conflict { ip, prefix: cidr });
            }
            prefix.remove(ip);
        }

        prefix.insert(ip, owner);
        debug!(prefix = %cidr, ip = %ip, owner, "Acquired specific IP");
        Ok(ip)
    }

    /// Return an address to `prefix`
    ///
    /// Releasing an address that is not held, or from a prefix that does not
    /// exist, is a no-op. Returns whether anything was released.
    pub fn release_ip(&mut self, prefix: &str, ip: IpAddr) -> bool {
        match self.prefix_mut(prefix) {
            Ok(prefix) => {
                let released = prefix.remove(ip);
                if released {
                    debug!(prefix = %prefix.cidr(), ip = %ip, "Released IP");
                }
                released
            }
            Err(_) => false,
        }
    }

    /// Look up a prefix by CIDR (normalized before lookup)
    pub fn prefix(&self, cidr: &str) -> Option<&Prefix> {
        parse_cidr(cidr).ok().and_then(|net| self.prefixes.get(&net))
    }

    /// All prefixes, in CIDR order
    pub fn prefixes(&self) -> impl Iterator<Item = &Prefix> {
        self.prefixes.values()
    }

    /// Root prefixes only
    pub fn roots(&self) -> impl Iterator<Item = &Prefix> {
        self.prefixes.values().filter(|p| p.is_root())
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Capacity figures for `prefix`
    pub fn usage(&self, prefix: &str) -> Option<Usage> {
        self.prefix(prefix).map(Prefix::usage)
    }

    fn prefix_mut(&mut self, cidr: &str) -> Result<&mut Prefix> {
        let net = parse_cidr(cidr)?;
        self.prefixes
            .get_mut(&net)
            .ok_or_else(|| AllocationError::UnknownPrefix(net.to_string()))
    }

    /// Snapshot of the forest for persistence
    pub fn to_state(&self) -> IpamState {
        IpamState {
            version: STATE_VERSION,
            prefixes: self
                .prefixes
                .values()
                .map(|prefix| PrefixState {
                    cidr: prefix.cidr().to_string(),
                    parent: prefix.parent().map(|p| p.to_string()),
                    owner: prefix.owner().map(str::to_string),
                    allocations: prefix
                        .allocations()
                        .map(|(ip, owner)| AllocationState {
                            ip,
                            owner: owner.to_string(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Rebuild a forest from a snapshot
    ///
    /// Every prefix and allocation is replayed through the normal mutation
    /// path, so a snapshot that violates an allocator invariant is rejected.
    pub fn from_state(state: IpamState) -> Result<Self, PersistenceError> {
        if state.version != STATE_VERSION {
            return Err(PersistenceError::CorruptState(format!(
                "unsupported state version {}",
                state.version
            )));
        }

        let mut parsed = Vec::with_capacity(state.prefixes.len());
        for prefix in state.prefixes {
            let net = parse_cidr(&prefix.cidr).map_err(corrupt)?;
            parsed.push((net, prefix));
        }
        // parents always have a shorter prefix length than their children
        parsed.sort_by_key(|(net, _)| net.prefix_len());

        let mut ipam = Self::new();
        for (_, prefix) in &parsed {
            match &prefix.parent {
                Some(parent) => ipam.create_child_prefix(parent, &prefix.cidr),
                None => ipam.create_prefix(&prefix.cidr),
            }
            .map_err(corrupt)?;
            if let Some(owner) = &prefix.owner {
                ipam.set_prefix_owner(&prefix.cidr, Some(owner))
                    .map_err(corrupt)?;
            }
        }
        for (_, prefix) in &parsed {
            for allocation in &prefix.allocations {
                ipam.acquire_specific_ip(&prefix.cidr, allocation.ip, &allocation.owner)
                    .map_err(corrupt)?;
            }
        }

        Ok(ipam)
    }

    /// Serialize the whole forest
    pub fn dump(&self) -> Result<String, PersistenceError> {
        Ok(serde_json::to_string_pretty(&self.to_state())?)
    }

    /// Replace the whole forest with the contents of `blob`
    ///
    /// Destructive: every existing prefix is deleted before the dump is
    /// installed. On error the current forest is left untouched.
    pub fn load(&mut self, blob: &str) -> Result<(), PersistenceError> {
        let state: IpamState = serde_json::from_str(blob)?;
        let restored = Self::from_state(state)?;

        self.delete_all_prefixes();
        *self = restored;
        Ok(())
    }

    /// Write the forest to `path`
    ///
    /// The dump goes to a sibling temp file first and is renamed into place,
    /// so a crash mid-write never leaves a truncated state file behind.
    pub async fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        let contents = self.dump()?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, contents).await?;
        tokio::fs::rename(&temp_path, path).await?;

        debug!(path = %path.display(), "Saved allocator state");
        Ok(())
    }

    /// Read a forest from `path`
    ///
    /// A missing file yields an empty allocator. A file that exists but
    /// cannot be decoded is an error.
    pub async fn restore(path: &Path) -> Result<Self, PersistenceError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No allocator state on disk, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut ipam = Self::new();
        ipam.load(&contents).inspect_err(|e| {
            warn!(path = %path.display(), error = %e, "Allocator state is unreadable");
        })?;
        Ok(ipam)
    }
}

fn corrupt(err: AllocationError) -> PersistenceError {
    PersistenceError::CorruptState(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_create_prefix_normalizes() {
        let mut ipam = Ipam::new();
        let prefix = ipam.create_prefix("192.168.1.5/24").unwrap();
        assert_eq!(prefix.cidr().to_string(), "192.168.1.0/24");
        assert!(ipam.prefix("192.168.1.0/24").is_some());
        assert!(ipam.prefix("192.168.1.77/24").is_some());
    }

    #[test]
    fn test_create_prefix_rejects_overlapping_roots() {
        let mut ipam = Ipam::with_root("10.0.0.0/16").unwrap();
        assert!(matches!(
            ipam.create_prefix("10.0.5.0/24"),
            Err(AllocationError::Overlap { .. })
        ));
        assert!(matches!(
            ipam.create_prefix("10.0.0.0/8"),
            Err(AllocationError::Overlap { .. })
        ));
        assert!(ipam.create_prefix("10.1.0.0/16").is_ok());
    }

    #[test]
    fn test_create_prefix_invalid() {
        let mut ipam = Ipam::new();
        assert!(matches!(
            ipam.create_prefix("invalid"),
            Err(AllocationError::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_acquire_sequential_and_exhaustion() {
        let mut ipam = Ipam::with_root("10.200.0.0/30").unwrap();

        // /30 has 2 usable hosts (excluding network and broadcast)
        assert_eq!(ipam.acquire_ip("10.200.0.0/30", "a").unwrap(), ip("10.200.0.1"));
        assert_eq!(ipam.acquire_ip("10.200.0.0/30", "b").unwrap(), ip("10.200.0.2"));
        assert_eq!(
            ipam.acquire_ip("10.200.0.0/30", "c"),
            Err(AllocationError::Exhausted("10.200.0.0/30".to_string()))
        );
    }

    #[test]
    fn test_acquire_unknown_prefix() {
        let mut ipam = Ipam::with_root("10.200.0.0/24").unwrap();
        assert!(matches!(
            ipam.acquire_ip("10.201.0.0/24", "a"),
            Err(AllocationError::UnknownPrefix(_))
        ));
    }

    #[test]
    fn test_release_then_reuse_lowest() {
        let mut ipam = Ipam::with_root("10.200.0.0/24").unwrap();
        let first = ipam.acquire_ip("10.200.0.0/24", "a").unwrap();
        let _second = ipam.acquire_ip("10.200.0.0/24", "b").unwrap();

        assert!(ipam.release_ip("10.200.0.0/24", first));
        assert_eq!(ipam.acquire_ip("10.200.0.0/24", "c").unwrap(), first);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ipam = Ipam::with_root("10.200.0.0/24").unwrap();
        assert!(!ipam.release_ip("10.200.0.0/24", ip("10.200.0.9")));
        assert!(!ipam.release_ip("10.99.0.0/24", ip("10.99.0.9")));
        assert!(!ipam.release_ip("garbage", ip("10.99.0.9")));
    }

    #[test]
    fn test_specific_same_owner_is_idempotent() {
        let mut ipam = Ipam::with_root("10.200.0.0/24").unwrap();
        let x = ip("10.200.0.50");

        assert_eq!(ipam.acquire_specific_ip("10.200.0.0/24", x, "a").unwrap(), x);
        assert_eq!(ipam.acquire_specific_ip("10.200.0.0/24", x, "a").unwrap(), x);
        assert_eq!(
            ipam.acquire_specific_ip("10.200.0.0/24", x, "b"),
            Err(AllocationError::Conflict {
                ip: x,
                prefix: "10.200.0.0/24".to_string()
            })
        );
        assert_eq!(ipam.prefix("10.200.0.0/24").unwrap().owner_of(x), Some("a"));
    }

    #[test]
    fn test_specific_out_of_range() {
        let mut ipam = Ipam::with_root("10.200.0.0/24").unwrap();
        for bad in ["192.168.1.1", "10.200.0.0", "10.200.0.255"] {
            assert!(matches!(
                ipam.acquire_specific_ip("10.200.0.0/24", ip(bad), "a"),
                Err(AllocationError::OutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_child_prefix_rules() {
        let mut ipam = Ipam::with_root("10.0.0.0/16").unwrap();

        let child = ipam.create_child_prefix("10.0.0.0/16", "10.0.1.7/24").unwrap();
        assert_eq!(child.cidr().to_string(), "10.0.1.0/24");
        assert_eq!(child.parent().unwrap().to_string(), "10.0.0.0/16");

        assert!(matches!(
            ipam.create_child_prefix("10.0.0.0/16", "10.0.1.128/25"),
            Err(AllocationError::Overlap { .. })
        ));
        assert!(matches!(
            ipam.create_child_prefix("10.0.0.0/16", "10.1.0.0/24"),
            Err(AllocationError::InvalidCidr(_))
        ));
        assert!(matches!(
            ipam.create_child_prefix("10.0.0.0/16", "10.0.0.0/16"),
            Err(AllocationError::InvalidCidr(_))
        ));
        assert!(matches!(
            ipam.create_child_prefix("10.9.0.0/16", "10.9.1.0/24"),
            Err(AllocationError::UnknownPrefix(_))
        ));
    }

    #[test]
    fn test_child_prefix_rejects_allocated_range() {
        let mut ipam = Ipam::with_root("10.0.0.0/24").unwrap();
        ipam.acquire_specific_ip("10.0.0.0/24", ip("10.0.0.70"), "a")
            .unwrap();

        assert!(matches!(
            ipam.create_child_prefix("10.0.0.0/24", "10.0.0.64/26"),
            Err(AllocationError::Overlap { .. })
        ));
    }

    #[test]
    fn test_parent_skips_delegated_range() {
        let mut ipam = Ipam::with_root("10.0.0.0/24").unwrap();
        ipam.create_child_prefix("10.0.0.0/24", "10.0.0.0/25").unwrap();

        assert_eq!(ipam.acquire_ip("10.0.0.0/24", "a").unwrap(), ip("10.0.0.128"));
        assert!(matches!(
            ipam.acquire_specific_ip("10.0.0.0/24", ip("10.0.0.5"), "a"),
            Err(AllocationError::Conflict { .. })
        ));
        assert_eq!(ipam.acquire_ip("10.0.0.0/25", "b").unwrap(), ip("10.0.0.1"));
    }

    #[test]
    fn test_delete_prefix_removes_subtree() {
        let mut ipam = Ipam::with_root("10.0.0.0/16").unwrap();
        ipam.create_child_prefix("10.0.0.0/16", "10.0.1.0/24").unwrap();
        ipam.create_child_prefix("10.0.1.0/24", "10.0.1.0/28").unwrap();

        ipam.delete_prefix("10.0.1.0/24").unwrap();
        assert!(ipam.prefix("10.0.1.0/24").is_none());
        assert!(ipam.prefix("10.0.1.0/28").is_none());
        assert_eq!(ipam.prefix("10.0.0.0/16").unwrap().children().count(), 0);

        assert!(matches!(
            ipam.delete_prefix("10.0.1.0/24"),
            Err(AllocationError::UnknownPrefix(_))
        ));
    }

    #[test]
    fn test_dump_load_roundtrip() {
        let mut ipam = Ipam::with_root("10.0.0.0/24").unwrap();
        ipam.create_child_prefix("10.0.0.0/24", "10.0.0.128/25").unwrap();
        ipam.acquire_ip("10.0.0.0/24", "a").unwrap();
        ipam.acquire_ip("10.0.0.128/25", "b").unwrap();

        let blob = ipam.dump().unwrap();

        let mut restored = Ipam::with_root("172.16.0.0/12").unwrap();
        restored.load(&blob).unwrap();

        assert_eq!(restored, ipam);
        assert!(restored.prefix("172.16.0.0/12").is_none());
    }

    #[test]
    fn test_prefix_owner_survives_dump() {
        let mut ipam = Ipam::with_root("10.0.0.0/16").unwrap();
        ipam.create_child_prefix("10.0.0.0/16", "10.0.4.0/24").unwrap();
        ipam.set_prefix_owner("10.0.4.0/24", Some("k1")).unwrap();
        assert_eq!(ipam.prefix("10.0.4.0/24").unwrap().owner(), Some("k1"));
        assert!(ipam.set_prefix_owner("10.9.0.0/24", Some("k1")).is_err());

        let mut restored = Ipam::new();
        restored.load(&ipam.dump().unwrap()).unwrap();
        assert_eq!(restored.prefix("10.0.4.0/24").unwrap().owner(), Some("k1"));
        assert_eq!(restored, ipam);

        restored.set_prefix_owner("10.0.4.0/24", None).unwrap();
        assert_eq!(restored.prefix("10.0.4.0/24").unwrap().owner(), None);
    }

    #[test]
    fn test_load_corrupt_keeps_forest() {
        let mut ipam = Ipam::with_root("10.0.0.0/24").unwrap();
        let err = ipam.load("{\"version\": 1, \"prefixes\": [{\"cidr\": \"nope\"}]}");
        assert!(matches!(err, Err(PersistenceError::CorruptState(_))));
        assert!(ipam.prefix("10.0.0.0/24").is_some());
    }

    #[test]
    fn test_load_rejects_duplicate_owners_for_one_address() {
        let blob = r#"{
            "version": 1,
            "prefixes": [{
                "cidr": "10.0.0.0/24",
                "allocations": [
                    {"ip": "10.0.0.1", "owner": "a"},
                    {"ip": "10.0.0.1", "owner": "b"}
                ]
            }]
        }"#;
        let mut ipam = Ipam::new();
        assert!(matches!(
            ipam.load(blob),
            Err(PersistenceError::CorruptState(_))
        ));
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let mut ipam = Ipam::new();
        assert!(ipam.load("{\"version\": 99, \"prefixes\": []}").is_err());
    }
}
