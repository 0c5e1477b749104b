//! Meshtower IPAM - hierarchical address allocation for mesh zones
//!
//! Carves unique overlay addresses out of CIDR prefixes, tracks which owner
//! holds each address, and persists the whole prefix forest to disk.
//!
//! # Modules
//!
//! - [`allocator`] - The prefix forest and its allocation operations
//! - [`prefix`] - A single CIDR block and CIDR parsing helpers
//! - [`error`] - Allocation and persistence errors
//!
//! # Example
//!
//! ```
//! use meshtower_ipam::Ipam;
//!
//! let mut ipam = Ipam::new();
//! let root = ipam.create_prefix("10.200.1.5/24").unwrap().cidr();
//! assert_eq!(root.to_string(), "10.200.1.0/24");
//!
//! let ip = ipam.acquire_ip("10.200.1.0/24", "peer-key").unwrap();
//! assert_eq!(ip.to_string(), "10.200.1.1");
//!
//! // Re-requesting one's own address is not a conflict
//! assert_eq!(ipam.acquire_specific_ip("10.200.1.0/24", ip, "peer-key").unwrap(), ip);
//! ```

pub mod allocator;
pub mod error;
pub mod prefix;

pub use allocator::{AllocationState, Ipam, IpamState, PrefixState, STATE_VERSION};
pub use error::{AllocationError, IpamError, PersistenceError, Result};
pub use prefix::{parse_cidr, Prefix, Usage};
