//! Error types for zone coordination

use meshtower_ipam::{AllocationError, PersistenceError};
use thiserror::Error;

/// A message on a zone channel could not be interpreted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload is not valid JSON or lacks required fields
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Payload decoded but carries an event this coordinator does not handle
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}

/// Pub/sub transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to the bus failed or dropped
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The bus or subscription has been closed
    #[error("Transport closed: {0}")]
    Closed(String),

    /// The bus answered with something unexpected
    #[error("Transport protocol error: {0}")]
    Protocol(String),

    /// The bus did not answer in time
    #[error("Transport request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl TransportError {
    /// Create a new transport protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// A lookup found nothing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} '{key}' not found")]
pub struct NotFoundError {
    pub kind: &'static str,
    pub key: String,
}

impl NotFoundError {
    #[must_use]
    pub fn zone(name: impl Into<String>) -> Self {
        Self {
            kind: "Zone",
            key: name.into(),
        }
    }

    #[must_use]
    pub fn peer(public_key: impl Into<String>) -> Self {
        Self {
            kind: "Peer",
            key: public_key.into(),
        }
    }
}

/// An address probe did not produce an observed mapping
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Address probe against {server} failed: {reason}")]
pub struct ProbeError {
    pub server: String,
    pub reason: String,
}

/// Errors that can occur while coordinating zones
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    /// A zone with this name is already running
    #[error("Zone '{0}' already exists")]
    ZoneExists(String),

    /// A peer is already registered with a different address
    #[error("Peer '{public_key}' is registered with {existing}, not {requested}")]
    PeerConflict {
        public_key: String,
        existing: String,
        requested: String,
    },

    /// Invalid coordinator or zone configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoordinatorError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for coordinator operations
pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
