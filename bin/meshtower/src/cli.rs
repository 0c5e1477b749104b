//! Command line interface

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use meshtower_coordinator::ZoneConfig;
use meshtower_observability::LogFormat;

/// Mesh overlay coordinator
#[derive(Debug, Parser)]
#[command(name = "meshtower")]
#[command(version, about = "Mesh overlay coordinator")]
pub(crate) struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "MESHTOWER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for per-zone allocator state
    #[arg(long, env = "MESHTOWER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// API bind address
    #[arg(long, env = "MESHTOWER_BIND")]
    pub bind: Option<SocketAddr>,

    /// Redis pub/sub address (`host` or `host:port`); in-process bus when unset
    #[arg(long, env = "MESHTOWER_STREAMER_ADDRESS")]
    pub streamer_address: Option<String>,

    /// Redis password
    #[arg(long, env = "MESHTOWER_STREAMER_PASSWD", hide_env_values = true)]
    pub streamer_passwd: Option<String>,

    /// Zone to serve, as `name=cidr`; repeatable, replaces configured zones
    #[arg(long = "zone", value_parser = parse_zone)]
    pub zones: Vec<ZoneConfig>,

    /// Zone behind the un-prefixed `/peers` routes
    #[arg(long)]
    pub default_zone: Option<String>,

    /// Keep allocator state in memory only
    #[arg(long)]
    pub no_persist: bool,

    /// Console log format: pretty, compact or json
    #[arg(long, env = "MESHTOWER_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_zone(raw: &str) -> Result<ZoneConfig, String> {
    let (name, cidr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=cidr, got '{}'", raw))?;
    if name.trim().is_empty() || cidr.trim().is_empty() {
        return Err(format!("expected name=cidr, got '{}'", raw));
    }
    Ok(ZoneConfig::new(name.trim(), cidr.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "meshtower",
            "--zone",
            "blue=10.1.0.0/24",
            "--zone",
            "red=10.2.0.0/24",
            "--streamer-address",
            "broker",
            "--log-format",
            "json",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.zones.len(), 2);
        assert_eq!(cli.zones[1].name, "red");
        assert_eq!(cli.streamer_address.as_deref(), Some("broker"));
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_bad_zone_flag() {
        assert!(Cli::try_parse_from(["meshtower", "--zone", "blue"]).is_err());
        assert!(parse_zone("=10.0.0.0/8").is_err());
    }
}
