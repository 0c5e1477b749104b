//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CoordinatorError, Result};

/// Name of the zone created when no zones are configured
pub const DEFAULT_ZONE_NAME: &str = "default";

/// Address prefix of the default zone
pub const DEFAULT_ZONE_CIDR: &str = "10.200.1.0/20";

/// Default Redis port for the streamer address
pub const DEFAULT_STREAMER_PORT: u16 = 6379;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Directory holding per-zone allocator state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Zones started at boot
    #[serde(default = "default_zones")]
    pub zones: Vec<ZoneConfig>,

    /// Zone served by the un-prefixed `/peers` routes
    #[serde(default = "default_zone_name")]
    pub default_zone: String,

    /// Write allocator state after every mutation and on shutdown
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Readiness responder for agents waiting on the coordinator
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,

    /// Pub/sub bus
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/meshtower")
}

fn default_zones() -> Vec<ZoneConfig> {
    vec![ZoneConfig::default()]
}

fn default_zone_name() -> String {
    DEFAULT_ZONE_NAME.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            zones: default_zones(),
            default_zone: default_zone_name(),
            persist: true,
            healthcheck: HealthcheckConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Path of the allocator state file for `zone`
    pub fn state_path(&self, zone: &str) -> Option<PathBuf> {
        self.persist
            .then(|| self.data_dir.join(format!("{}-ipam.json", zone)))
    }
}

/// One isolated zone: channel name, prefix, and description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZoneConfig {
    /// Zone name, also the pub/sub channel name
    pub name: String,

    /// Human readable description
    #[serde(default)]
    pub description: String,

    /// Address prefix peers of this zone are allocated from
    pub cidr: String,
}

/// Check that `name` is usable as a channel name and a state file stem
///
/// Only ASCII letters, digits, `-` and `_` are accepted.
pub fn validate_zone_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(CoordinatorError::config(format!(
            "invalid zone name '{}': use letters, digits, '-' or '_'",
            name
        )));
    }
    Ok(())
}

impl ZoneConfig {
    pub fn new(name: impl Into<String>, cidr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            cidr: cidr.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_ZONE_NAME.to_string(),
            description: "Default Zone".to_string(),
            cidr: DEFAULT_ZONE_CIDR.to_string(),
        }
    }
}

/// Readiness request/reply channels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthcheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_request_channel")]
    pub request_channel: String,

    #[serde(default = "default_reply_channel")]
    pub reply_channel: String,

    /// Message on the request channel that triggers a reply
    #[serde(default = "default_ready_request")]
    pub ready_request: String,

    /// Message published on the reply channel
    #[serde(default = "default_reply_message")]
    pub reply_message: String,
}

fn default_request_channel() -> String {
    "meshtower-healthcheck-request".to_string()
}

fn default_reply_channel() -> String {
    "meshtower-healthcheck-reply".to_string()
}

fn default_ready_request() -> String {
    "meshtower-ready-request".to_string()
}

fn default_reply_message() -> String {
    "meshtower-healthy".to_string()
}

impl HealthcheckConfig {
    /// Whether `channel` is one of the readiness channels
    pub fn uses_channel(&self, channel: &str) -> bool {
        channel == self.request_channel || channel == self.reply_channel
    }
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_channel: default_request_channel(),
            reply_channel: default_reply_channel(),
            ready_request: default_ready_request(),
            reply_message: default_reply_message(),
        }
    }
}

/// Which bus carries zone channels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// In-process bus, for tests and single-process setups
    #[default]
    Memory,

    /// Redis pub/sub
    Redis {
        /// `host:port`; a bare host gets the default port
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
}

impl TransportConfig {
    /// Redis transport from a streamer address, appending the default port when absent
    pub fn redis(address: &str, password: Option<String>) -> Self {
        let address = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, DEFAULT_STREAMER_PORT)
        };
        Self::Redis { address, password }
    }
}
