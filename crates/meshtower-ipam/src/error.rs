//! Error types for address allocation and allocator persistence

use std::net::IpAddr;
use thiserror::Error;

/// Errors raised by allocator mutations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// CIDR could not be parsed or is not acceptable in this position
    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),

    /// Requested prefix collides with an existing prefix or allocation
    #[error("Prefix {requested} overlaps {existing}")]
    Overlap { requested: String, existing: String },

    /// Every usable address in the prefix is taken
    #[error("No available IP addresses in prefix {0}")]
    Exhausted(String),

    /// Address is held by a different owner
    #[error("IP address {ip} in prefix {prefix} is already held by another owner")]
    Conflict { ip: IpAddr, prefix: String },

    /// Address is outside the prefix or is a reserved address of it
    #[error("IP address {ip} is not an assignable address of prefix {prefix}")]
    OutOfRange { ip: IpAddr, prefix: String },

    /// No prefix with this CIDR exists in the forest
    #[error("Prefix {0} not found")]
    UnknownPrefix(String),
}

/// Errors raised while saving or restoring allocator state
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Underlying file system failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted blob could not be decoded or replayed
    #[error("Corrupt allocator state: {0}")]
    CorruptState(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::CorruptState(err.to_string())
    }
}

/// Umbrella error for callers that mix allocation and persistence
#[derive(Debug, Error)]
pub enum IpamError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Result type alias for allocator operations
pub type Result<T, E = AllocationError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AllocationError::Exhausted("10.0.0.0/30".to_string());
        assert_eq!(
            err.to_string(),
            "No available IP addresses in prefix 10.0.0.0/30"
        );

        let err = AllocationError::Conflict {
            ip: "10.0.0.5".parse().unwrap(),
            prefix: "10.0.0.0/24".to_string(),
        };
        assert!(err.to_string().contains("10.0.0.5"));
    }

    #[test]
    fn test_json_error_is_corrupt_state() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: PersistenceError = json_err.into();
        assert!(matches!(err, PersistenceError::CorruptState(_)));
    }
}
