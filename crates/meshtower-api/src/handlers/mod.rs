//! HTTP handlers

pub mod health;
pub mod leases;
pub mod peers;
pub mod zones;

use std::sync::Arc;

use meshtower_coordinator::Coordinator;

/// Shared state of every handler
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
}

impl ApiState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

/// Saturating conversion for allocator counters, which are 128-bit
pub(crate) fn count(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
