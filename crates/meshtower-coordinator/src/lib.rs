//! Meshtower coordinator - zone-isolated peer registration
//!
//! Every zone has its own pub/sub channel, address prefix, and peer registry.
//! Agents publish registration requests on their zone channel; the zone loop
//! assigns each new peer a stable overlay address and answers with the full
//! peer set of the zone on the same channel.
//!
//! # Modules
//!
//! - [`coordinator`] - Multi-zone lifecycle and the per-zone consumer loop
//! - [`zone`] - Zone state and the handle shared with the query surface
//! - [`registry`] - Public key to peer record mapping
//! - [`protocol`] - JSON wire messages
//! - [`transport`] - Pub/sub abstraction with in-memory and Redis buses
//! - [`nat`] - NAT classification from reflexive address probes
//! - [`config`] - Coordinator, zone, and transport configuration
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```no_run
//! use meshtower_coordinator::{connect, Coordinator, CoordinatorConfig, MsgEvent, Peer};
//!
//! # async fn run() -> meshtower_coordinator::Result<()> {
//! let config = CoordinatorConfig::default();
//! let bus = connect(&config.transport).await?;
//! let coordinator = Coordinator::start(config, bus.clone()).await?;
//!
//! let request = MsgEvent::register(Peer::new("agent-public-key", "203.0.113.7:51820"));
//! bus.publish("default", request.to_bytes()?).await?;
//!
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod nat;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod zone;

pub use config::{
    validate_zone_name, CoordinatorConfig, HealthcheckConfig, TransportConfig, ZoneConfig,
    DEFAULT_STREAMER_PORT, DEFAULT_ZONE_CIDR, DEFAULT_ZONE_NAME,
};
pub use coordinator::Coordinator;
pub use error::{
    CoordinatorError, NotFoundError, ProbeError, ProtocolError, Result, TransportError,
};
pub use nat::{classify_nat, AddressProbe, NatKind};
pub use protocol::{decode, encode_peer_list, Inbound, MsgEvent, Peer, PEER_LIST, REGISTER_NODE_REQUEST};
pub use registry::ZoneRegistry;
pub use transport::{connect, MemoryBus, PubSub, RedisBus, Subscription};
pub use zone::{
    InjectOutcome, Lease, PrefixLease, Registration, ZoneHandle, ZoneInfo, ZoneState, ZoneSummary,
};
