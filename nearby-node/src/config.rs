//! Load config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nearby_core::Timing;

/// Node configuration. File: ~/.config/nearby/config.toml or /etc/nearby/config.toml.
/// Env overrides: NEARBY_DISCOVERY_PORT, NEARBY_MULTICAST_GROUP, NEARBY_TRANSPORT_PORT,
/// NEARBY_ANNOUNCE_INTERVAL_MS, NEARBY_PEER_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45880).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// IPv4 multicast group for announcements (default 239.255.77.77).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// Address the session listener binds (default 0.0.0.0).
    #[serde(default = "default_transport_bind")]
    pub transport_bind: IpAddr,
    /// Session TCP port; 0 picks an ephemeral port, which is what gets announced.
    #[serde(default)]
    pub transport_port: u16,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    /// How often timers (invite deadlines, retransmits, heartbeats) are checked.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_link_timeout_ms")]
    pub link_timeout_ms: u64,
    /// TCP connect plus hello exchange.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_discovery_port() -> u16 {
    45880
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 77, 77)
}
fn default_transport_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_announce_interval_ms() -> u64 {
    4_000
}
fn default_peer_timeout_ms() -> u64 {
    16_000
}
fn default_tick_interval_ms() -> u64 {
    250
}
fn default_ack_timeout_ms() -> u64 {
    2_000
}
fn default_max_retransmits() -> u32 {
    5
}
fn default_heartbeat_interval_ms() -> u64 {
    2_000
}
fn default_link_timeout_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            multicast_group: default_multicast_group(),
            transport_bind: default_transport_bind(),
            transport_port: 0,
            announce_interval_ms: default_announce_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retransmits: default_max_retransmits(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            link_timeout_ms: default_link_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Config {
    /// Protocol timers handed to the core.
    pub fn timing(&self) -> Timing {
        Timing {
            announce_interval: Duration::from_millis(self.announce_interval_ms),
            peer_timeout: Duration::from_millis(self.peer_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retransmits: self.max_retransmits,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            link_timeout: Duration::from_millis(self.link_timeout_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// Load config: default, then config file (`path`, or the first existing default path),
/// then env vars.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match path {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(
    c: &mut Config,
    lookup: impl Fn(&'static str) -> Option<String>,
) -> Result<(), ConfigError> {
    fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { var, value })
    }
    if let Some(v) = lookup("NEARBY_DISCOVERY_PORT") {
        c.discovery_port = parse("NEARBY_DISCOVERY_PORT", v)?;
    }
    if let Some(v) = lookup("NEARBY_MULTICAST_GROUP") {
        c.multicast_group = parse("NEARBY_MULTICAST_GROUP", v)?;
    }
    if let Some(v) = lookup("NEARBY_TRANSPORT_PORT") {
        c.transport_port = parse("NEARBY_TRANSPORT_PORT", v)?;
    }
    if let Some(v) = lookup("NEARBY_ANNOUNCE_INTERVAL_MS") {
        c.announce_interval_ms = parse("NEARBY_ANNOUNCE_INTERVAL_MS", v)?;
    }
    if let Some(v) = lookup("NEARBY_PEER_TIMEOUT_MS") {
        c.peer_timeout_ms = parse("NEARBY_PEER_TIMEOUT_MS", v)?;
    }
    Ok(())
}
