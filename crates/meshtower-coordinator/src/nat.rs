//! NAT classification from reflexive address probes
//!
//! Agents ask two independent probe servers for their externally observed
//! address using the same local port. A NAT that hands out a different
//! mapping per destination is symmetric and cannot be hole punched.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ProbeError;

/// Resolves the externally observed address for a local source port
#[async_trait]
pub trait AddressProbe: Send + Sync {
    async fn probe(&self, local_port: u16, server: &str) -> Result<SocketAddr, ProbeError>;
}

/// How the local NAT maps outbound flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatKind {
    /// Mapping differs per destination
    Symmetric,
    /// Same mapping regardless of destination
    Consistent,
}

impl NatKind {
    pub fn is_symmetric(self) -> bool {
        self == NatKind::Symmetric
    }
}

/// Compare the mappings observed by two probe servers from the same source port
pub async fn classify_nat<P>(
    probe: &P,
    local_port: u16,
    first: &str,
    second: &str,
) -> Result<NatKind, ProbeError>
where
    P: AddressProbe + ?Sized,
{
    let a = probe.probe(local_port, first).await?;
    debug!(server = first, observed = %a, "Probe result");
    let b = probe.probe(local_port, second).await?;
    debug!(server = second, observed = %b, "Probe result");

    let kind = if a == b {
        NatKind::Consistent
    } else {
        NatKind::Symmetric
    };
    info!(local_port, ?kind, "Classified NAT");
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedProbe(HashMap<&'static str, SocketAddr>);

    #[async_trait]
    impl AddressProbe for FixedProbe {
        async fn probe(&self, _local_port: u16, server: &str) -> Result<SocketAddr, ProbeError> {
            self.0.get(server).copied().ok_or_else(|| ProbeError {
                server: server.to_string(),
                reason: "timed out".to_string(),
            })
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_same_mapping_is_consistent() {
        let probe = FixedProbe(HashMap::from([
            ("stun1", addr("203.0.113.7:51820")),
            ("stun2", addr("203.0.113.7:51820")),
        ]));
        let kind = classify_nat(&probe, 51820, "stun1", "stun2").await.unwrap();
        assert_eq!(kind, NatKind::Consistent);
        assert!(!kind.is_symmetric());
    }

    #[tokio::test]
    async fn test_different_port_is_symmetric() {
        let probe = FixedProbe(HashMap::from([
            ("stun1", addr("203.0.113.7:40001")),
            ("stun2", addr("203.0.113.7:40002")),
        ]));
        let kind = classify_nat(&probe, 51820, "stun1", "stun2").await.unwrap();
        assert_eq!(kind, NatKind::Symmetric);
    }

    #[tokio::test]
    async fn test_probe_failure_propagates() {
        let probe = FixedProbe(HashMap::from([("stun1", addr("203.0.113.7:40001"))]));
        let err = classify_nat(&probe, 51820, "stun1", "stun2").await.unwrap_err();
        assert_eq!(err.server, "stun2");
    }
}
