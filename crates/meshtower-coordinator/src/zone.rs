//! State of one isolated zone and the handle shared by its writers
//!
//! A zone owns its allocator forest and peer registry. Both the zone loop and
//! the query surface mutate them only through a [`ZoneHandle`], which holds
//! the zone's exclusive lock for the whole of a mutation and the follow-up
//! persist. The resulting snapshot is queued under the same lock and
//! published by the zone's outbox task once the lock is released.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ipnet::IpNet;
use meshtower_ipam::{parse_cidr, Ipam, PersistenceError, Usage};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{validate_zone_name, ZoneConfig};
use crate::error::{CoordinatorError, NotFoundError, ProtocolError, Result};
use crate::protocol::{encode_peer_list, Peer};
use crate::registry::ZoneRegistry;
use crate::transport::PubSub;

/// Identity of a running zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneInfo {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Canonical zone prefix
    pub cidr: IpNet,
}

/// Zone identity plus live counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSummary {
    #[serde(flatten)]
    pub info: ZoneInfo,
    pub peer_count: usize,
    pub usage: Usage,
}

/// One held address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub address: IpAddr,
    pub owner: String,
}

/// A prefix of the zone forest with the addresses it has handed out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixLease {
    pub cidr: IpNet,
    pub parent: Option<IpNet>,
    pub leases: Vec<Lease>,
    pub usage: Usage,
}

/// Longest a snapshot publish may take before it is abandoned
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a registration or injection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Known peer; only its endpoint changed
    Refreshed(Peer),
    /// New peer; the allocator was mutated
    Joined(Peer),
}

impl Registration {
    pub fn peer(&self) -> &Peer {
        match self {
            Registration::Refreshed(peer) | Registration::Joined(peer) => peer,
        }
    }

    pub fn into_peer(self) -> Peer {
        match self {
            Registration::Refreshed(peer) | Registration::Joined(peer) => peer,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::Joined(_))
    }
}

/// Accepted and rejected peers of a manual injection
#[derive(Debug, Default)]
pub struct InjectOutcome {
    pub accepted: Vec<Peer>,
    pub rejected: Vec<(String, CoordinatorError)>,
}

/// Host route of an overlay address
fn host_route(address: IpAddr) -> IpNet {
    IpNet::from(address)
}

/// `AllowedIPs` for a peer: its host route plus any delegated prefix
fn allowed_ips(address: IpAddr, child: Option<IpNet>) -> String {
    match child {
        Some(child) => format!("{},{}", host_route(address), child),
        None => host_route(address).to_string(),
    }
}

/// Accepts `10.0.0.5` as well as `10.0.0.5/32`
fn parse_node_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.split('/').next().and_then(|ip| ip.parse().ok())
}

/// Allocator and registry of one zone
#[derive(Debug)]
pub struct ZoneState {
    info: ZoneInfo,
    ipam: Ipam,
    registry: ZoneRegistry,
    state_path: Option<PathBuf>,
}

impl ZoneState {
    /// Build a zone around `ipam`, creating the zone prefix if the forest lacks it
    pub fn new(config: &ZoneConfig, mut ipam: Ipam, state_path: Option<PathBuf>) -> Result<Self> {
        validate_zone_name(&config.name)?;
        let name = config.name.as_str();

        let cidr = parse_cidr(&config.cidr)?;
        if ipam.prefix(&cidr.to_string()).is_none() {
            ipam.create_prefix(&cidr.to_string())?;
        }

        Ok(Self {
            info: ZoneInfo {
                id: Uuid::new_v4(),
                name: name.to_string(),
                description: config.description.clone(),
                cidr,
            },
            ipam,
            registry: ZoneRegistry::new(name),
            state_path,
        })
    }

    pub fn info(&self) -> &ZoneInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    pub fn registry(&self) -> &ZoneRegistry {
        &self.registry
    }

    fn root(&self) -> String {
        self.info.cidr.to_string()
    }

    /// Apply a registration request
    ///
    /// A known key only has its endpoint replaced. A new key gets the address
    /// it already holds in the allocator, else its requested address, else
    /// the first free one. Exhaustion fails with nothing committed.
    pub fn register(&mut self, request: Peer) -> Result<Registration> {
        let key = request.public_key.clone();
        if let Some(peer) = self.registry.update_endpoint(&key, &request.endpoint_ip) {
            debug!(zone = %self.info.name, public_key = %key, endpoint = %peer.endpoint_ip, "Refreshed peer endpoint");
            return Ok(Registration::Refreshed(peer.clone()));
        }

        let address = self.assign_address(&key, &request.node_address)?;
        let child = self.claim_child_prefix(&key, &request.child_prefix);

        let peer = Peer {
            allowed_ips: allowed_ips(address, child),
            node_address: address.to_string(),
            child_prefix: child.map(|c| c.to_string()).unwrap_or_default(),
            ..request
        };
        self.registry.insert(peer);

        self.registry
            .get(&key)
            .cloned()
            .map(Registration::Joined)
            .ok_or_else(|| NotFoundError::peer(key).into())
    }

    fn assign_address(&mut self, key: &str, requested: &str) -> Result<IpAddr> {
        let root = self.root();

        if let Some(ip) = self.ipam.prefix(&root).and_then(|p| p.address_of(key)) {
            debug!(zone = %self.info.name, public_key = %key, address = %ip, "Reusing address held by peer");
            return Ok(ip);
        }

        if !requested.trim().is_empty() {
            match parse_node_address(requested) {
                Some(ip) => match self.ipam.acquire_specific_ip(&root, ip, key) {
                    Ok(ip) => return Ok(ip),
                    Err(e) => {
                        warn!(zone = %self.info.name, public_key = %key, requested = %ip, error = %e, "Requested address unavailable, allocating from pool");
                    }
                },
                None => {
                    warn!(zone = %self.info.name, public_key = %key, requested, "Requested address is not an IP, allocating from pool");
                }
            }
        }

        Ok(self.ipam.acquire_ip(&root, key)?)
    }

    /// Delegate `requested` to the peer, or return `None` and log why not
    ///
    /// Delegated prefixes are tagged with the peer's key in the allocator, so
    /// after a restart an existing prefix goes back to the peer that held it.
    /// An untagged prefix under the zone prefix is granted when no registered
    /// peer claims it.
    fn claim_child_prefix(&mut self, key: &str, requested: &str) -> Option<IpNet> {
        if requested.trim().is_empty() {
            return None;
        }

        let net = match parse_cidr(requested) {
            Ok(net) => net,
            Err(e) => {
                warn!(zone = %self.info.name, public_key = %key, error = %e, "Ignoring child prefix request");
                return None;
            }
        };
        let cidr = net.to_string();

        if let Some(existing) = self.ipam.prefix(&cidr) {
            let under_root = existing.parent() == Some(self.info.cidr);
            let grantable = match existing.owner() {
                Some(owner) => owner == key,
                None => !self.registry.peers().any(|p| p.child_prefix == cidr),
            };
            if !(under_root && grantable) {
                warn!(zone = %self.info.name, public_key = %key, prefix = %cidr, "Child prefix already delegated");
                return None;
            }
        } else {
            let root = self.root();
            if let Err(e) = self.ipam.create_child_prefix(&root, &cidr) {
                warn!(zone = %self.info.name, public_key = %key, error = %e, "Child prefix not granted");
                return None;
            }
        }

        if let Err(e) = self.ipam.set_prefix_owner(&cidr, Some(key)) {
            warn!(zone = %self.info.name, public_key = %key, error = %e, "Child prefix not granted");
            return None;
        }
        Some(net)
    }

    /// Record an administratively supplied peer
    ///
    /// The peer must carry its address. The address is recorded in the
    /// allocator for the peer's key; a key already registered with another
    /// address is rejected.
    pub fn inject(&mut self, peer: Peer) -> Result<Registration> {
        let key = peer.public_key.trim().to_string();
        if key.is_empty() {
            return Err(ProtocolError::Malformed("peer without a public key".to_string()).into());
        }
        let ip = parse_node_address(&peer.node_address).ok_or_else(|| {
            ProtocolError::Malformed(format!("peer '{}' has no valid NodeAddress", key))
        })?;

        if let Some(existing) = self.registry.get(&key) {
            if parse_node_address(&existing.node_address) != Some(ip) {
                return Err(CoordinatorError::PeerConflict {
                    public_key: key,
                    existing: existing.node_address.clone(),
                    requested: ip.to_string(),
                });
            }
            let refreshed = self
                .registry
                .update_endpoint(&key, &peer.endpoint_ip)
                .cloned()
                .ok_or_else(|| NotFoundError::peer(key.clone()))?;
            return Ok(Registration::Refreshed(refreshed));
        }

        let root = self.root();
        let previous = self.ipam.prefix(&root).and_then(|p| p.address_of(&key));
        self.ipam.acquire_specific_ip(&root, ip, &key)?;
        if let Some(old) = previous.filter(|old| *old != ip) {
            self.ipam.release_ip(&root, old);
        }

        let child = self.claim_child_prefix(&key, &peer.child_prefix);
        let allowed = if peer.allowed_ips.trim().is_empty() {
            allowed_ips(ip, child)
        } else {
            peer.allowed_ips.clone()
        };

        self.registry.insert(Peer {
            public_key: key.clone(),
            allowed_ips: allowed,
            node_address: ip.to_string(),
            child_prefix: child.map(|c| c.to_string()).unwrap_or_default(),
            ..peer
        });

        self.registry
            .get(&key)
            .cloned()
            .map(Registration::Joined)
            .ok_or_else(|| NotFoundError::peer(key).into())
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.registry.snapshot()
    }

    pub fn summary(&self) -> ZoneSummary {
        ZoneSummary {
            info: self.info.clone(),
            peer_count: self.registry.len(),
            usage: self.ipam.usage(&self.root()).unwrap_or(Usage {
                capacity: 0,
                allocated: 0,
                delegated: 0,
                available: 0,
            }),
        }
    }

    /// Every prefix of the zone forest with its held addresses
    pub fn leases(&self) -> Vec<PrefixLease> {
        self.ipam
            .prefixes()
            .map(|prefix| PrefixLease {
                cidr: prefix.cidr(),
                parent: prefix.parent(),
                leases: prefix
                    .allocations()
                    .map(|(address, owner)| Lease {
                        address,
                        owner: owner.to_string(),
                    })
                    .collect(),
                usage: prefix.usage(),
            })
            .collect()
    }

    /// Write the allocator to its state file, if persistence is enabled
    pub async fn persist(&self) -> std::result::Result<(), PersistenceError> {
        match &self.state_path {
            Some(path) => self.ipam.save(path).await,
            None => Ok(()),
        }
    }

    /// The full peer set encoded for the zone channel
    pub fn encode_snapshot(&self) -> Option<Bytes> {
        match encode_peer_list(&self.snapshot()) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(zone = %self.info.name, error = %e, "Failed to encode peer list");
                None
            }
        }
    }
}

/// Publishes queued snapshots of one zone, newest first wins
///
/// Ends once every handle of the zone is dropped.
async fn run_outbox(zone: Arc<str>, bus: Arc<dyn PubSub>, mut snapshots: watch::Receiver<Bytes>) {
    while snapshots.changed().await.is_ok() {
        let payload = snapshots.borrow_and_update().clone();

        match tokio::time::timeout(PUBLISH_TIMEOUT, bus.publish(&zone, payload)).await {
            Ok(Ok(receivers)) => debug!(zone = %zone, receivers, "Broadcast peer list"),
            Ok(Err(e)) => warn!(zone = %zone, error = %e, "Failed to publish peer list"),
            Err(_) => warn!(zone = %zone, timeout = ?PUBLISH_TIMEOUT, "Timed out publishing peer list"),
        }
    }
    debug!(zone = %zone, "Zone outbox closed");
}

/// Shared handle to a running zone
#[derive(Clone)]
pub struct ZoneHandle {
    name: Arc<str>,
    state: Arc<Mutex<ZoneState>>,
    outbox: Arc<watch::Sender<Bytes>>,
}

impl fmt::Debug for ZoneHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneHandle").field("name", &self.name).finish()
    }
}

impl ZoneHandle {
    /// Wrap `state` and spawn the zone's outbox task on the current runtime
    pub fn new(state: ZoneState, bus: Arc<dyn PubSub>) -> Self {
        let name: Arc<str> = Arc::from(state.name());
        let (outbox, snapshots) = watch::channel(Bytes::new());
        tokio::spawn(run_outbox(name.clone(), bus, snapshots));

        Self {
            name,
            state: Arc::new(Mutex::new(state)),
            outbox: Arc::new(outbox),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue the snapshot of `state` for the outbox
    ///
    /// Called with the zone lock held so snapshots are queued in commit order.
    fn queue_broadcast(&self, state: &ZoneState) {
        if let Some(payload) = state.encode_snapshot() {
            self.outbox.send_replace(payload);
        }
    }

    /// Register a peer, persist if the allocator changed, and broadcast
    pub async fn register(&self, request: Peer) -> Result<Peer> {
        let mut state = self.state.lock().await;
        let registration = state.register(request)?;

        if registration.is_new() {
            let peer = registration.peer();
            info!(zone = %self.name, public_key = %peer.public_key, address = %peer.node_address, "Registered peer");
            persist_logged(&state).await;
        }
        self.queue_broadcast(&state);

        Ok(registration.into_peer())
    }

    /// Inject peers administratively; rejected peers are logged and reported
    pub async fn inject(&self, peers: Vec<Peer>) -> InjectOutcome {
        let mut state = self.state.lock().await;
        let mut outcome = InjectOutcome::default();
        let mut mutated = false;

        for peer in peers {
            let key = peer.public_key.clone();
            match state.inject(peer) {
                Ok(registration) => {
                    mutated |= registration.is_new();
                    outcome.accepted.push(registration.into_peer());
                }
                Err(e) => {
                    warn!(zone = %self.name, public_key = %key, error = %e, "Rejected injected peer");
                    outcome.rejected.push((key, e));
                }
            }
        }

        if mutated {
            persist_logged(&state).await;
        }
        if !outcome.accepted.is_empty() {
            self.queue_broadcast(&state);
        }
        outcome
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.state.lock().await.snapshot()
    }

    pub async fn peer(&self, public_key: &str) -> Result<Peer> {
        self.state
            .lock()
            .await
            .registry()
            .get(public_key)
            .cloned()
            .ok_or_else(|| NotFoundError::peer(public_key).into())
    }

    pub async fn summary(&self) -> ZoneSummary {
        self.state.lock().await.summary()
    }

    pub async fn leases(&self) -> Vec<PrefixLease> {
        self.state.lock().await.leases()
    }

    pub async fn persist(&self) -> std::result::Result<(), PersistenceError> {
        self.state.lock().await.persist().await
    }
}

async fn persist_logged(state: &ZoneState) {
    if let Err(e) = state.persist().await {
        warn!(zone = %state.name(), error = %e, "Failed to persist allocator state");
    }
}
