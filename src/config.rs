// src/config.rs
//
// Runtime configuration read from the environment (and a .env file, loaded
// by the binaries before calling `AppConfig::from_env`).

use anyhow::{anyhow, Result};
use log::warn;
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::networking::discovery::DiscoveryConfig;
use crate::networking::file_transfer::{FrameLimits, TransferOptions, DEFAULT_PORT};

/// Configuration for a node
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// TCP port the transfer server listens on
    pub tcp_port: u16,

    /// Multicast discovery settings
    pub discovery: DiscoveryConfig,

    /// Chunking, header limits and progress throttling
    pub transfer: TransferOptions,

    /// Directory received files are written to
    pub receive_dir: PathBuf,

    /// How long to wait for busy connections on shutdown; `None` waits forever
    pub shutdown_grace: Option<Duration>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_PORT,
            discovery: DiscoveryConfig::default(),
            transfer: TransferOptions::default(),
            receive_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            shutdown_grace: None,
        }
    }
}

impl AppConfig {
    /// Read configuration from `LANSHARE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Unparseable values
    /// are logged and replaced by their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let discovery = &defaults.discovery;
        let transfer = &defaults.transfer;

        let config = Self {
            tcp_port: parse_or(&lookup, "LANSHARE_PORT", defaults.tcp_port),
            discovery: DiscoveryConfig {
                multicast_group: parse_or::<Ipv4Addr, _>(
                    &lookup,
                    "LANSHARE_MULTICAST_GROUP_ADDRESS",
                    discovery.multicast_group,
                ),
                multicast_port: parse_or(
                    &lookup,
                    "LANSHARE_MULTICAST_PORT",
                    discovery.multicast_port,
                ),
                announce_interval: Duration::from_secs(parse_or(
                    &lookup,
                    "LANSHARE_ANNOUNCE_INTERVAL_SECONDS",
                    discovery.announce_interval.as_secs(),
                )),
                peer_timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "LANSHARE_PEER_TIMEOUT_SECONDS",
                    discovery.peer_timeout.as_secs(),
                )),
            },
            transfer: TransferOptions {
                chunk_size: parse_or(&lookup, "LANSHARE_CHUNK_SIZE", transfer.chunk_size),
                limits: FrameLimits {
                    max_filename_len: parse_or(
                        &lookup,
                        "LANSHARE_MAX_FILENAME_LEN",
                        transfer.limits.max_filename_len,
                    ),
                    max_content_len: parse_or(
                        &lookup,
                        "LANSHARE_MAX_CONTENT_LEN",
                        transfer.limits.max_content_len,
                    ),
                },
                progress_interval: transfer.progress_interval,
            },
            receive_dir: lookup("LANSHARE_RECEIVE_DIR")
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.receive_dir.clone()),
            shutdown_grace: parse_optional::<u64, _>(&lookup, "LANSHARE_SHUTDOWN_GRACE_SECONDS")
                .map(Duration::from_secs),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.discovery.multicast_group.is_multicast() {
            return Err(anyhow!(
                "{} is not a multicast group address",
                self.discovery.multicast_group
            ));
        }
        if self.discovery.announce_interval.is_zero() {
            return Err(anyhow!("Announce interval must be at least one second"));
        }
        if self.discovery.peer_timeout.is_zero() {
            return Err(anyhow!("Peer timeout must be at least one second"));
        }
        if self.transfer.chunk_size == 0 {
            return Err(anyhow!("Chunk size must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    parse_optional(lookup, key).unwrap_or(default)
}

/// Parsed value of `key`, or `None` when it is unset or invalid
fn parse_optional<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring invalid {}={:?}: {}", key, raw, e);
            None
        }
    }
}
