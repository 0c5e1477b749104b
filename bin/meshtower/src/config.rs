//! File configuration and command line overrides

use std::path::Path;

use anyhow::{Context, Result};
use meshtower_api::ApiConfig;
use meshtower_coordinator::{CoordinatorConfig, TransportConfig};
use meshtower_observability::LoggingConfig;
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

/// Everything the daemon needs, as read from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub(crate) struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Config file (or defaults) with flags layered on top
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(cli);
        Ok(config)
    }

    fn apply(&mut self, cli: &Cli) {
        let coordinator = &mut self.coordinator;

        if let Some(dir) = &cli.data_dir {
            coordinator.data_dir = dir.clone();
        }
        if cli.no_persist {
            coordinator.persist = false;
        }
        if let Some(address) = &cli.streamer_address {
            coordinator.transport = TransportConfig::redis(address, cli.streamer_passwd.clone());
        }
        if !cli.zones.is_empty() {
            coordinator.zones = cli.zones.clone();
            if cli.default_zone.is_none() {
                coordinator.default_zone = cli.zones[0].name.clone();
            }
        }
        if let Some(name) = &cli.default_zone {
            coordinator.default_zone = name.clone();
        }

        if let Some(bind) = cli.bind {
            self.api.bind = bind;
        }

        if let Some(format) = cli.log_format {
            self.logging.format = format;
        }
        self.logging.level = self.logging.level.raised_by(cli.verbose);
    }
}
