//! Configuration surface for the reconciliation engine.
//!
//! Mirrors the teacher's `config::{DEFAULT_PATH, ENV_VAR}` convention: a
//! single TOML file, read once at startup (there is no persisted state to
//! reconcile against, per spec — everything is rebuilt from the kernel).
//! Every field carries a default so a missing file, or a file that only
//! overrides a handful of knobs, still produces a complete configuration.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use crate::kernel::constants;

pub const DEFAULT_PATH: &str = "/etc/egressd/config.toml";
pub const ENV_VAR: &str = "EGRESSD_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub lb_table: u32,
    pub lb_pref: u32,
    #[serde(with = "humantime_serde")]
    pub debounce_time: Duration,
    pub health_check_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check_timeout: Duration,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub probe_target: Ipv4Addr,
    pub probe_port: u16,
    pub draining_enabled: bool,
    pub affinity_enabled: bool,
    pub hysteresis_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    #[serde(with = "humantime_serde")]
    pub hold_down: Duration,
    pub consistent_nat: bool,
    pub neighbor_reachability: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lb_table: constants::DEFAULT_LB_TABLE,
            lb_pref: constants::DEFAULT_LB_PREF,
            debounce_time: Duration::from_secs(2),
            health_check_enabled: true,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(3),
            failure_threshold: 2,
            recovery_threshold: 1,
            probe_target: Ipv4Addr::new(1, 1, 1, 1),
            probe_port: 53,
            draining_enabled: true,
            affinity_enabled: false,
            hysteresis_enabled: true,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(300),
            hold_down: Duration::from_secs(60),
            consistent_nat: true,
            neighbor_reachability: true,
        }
    }
}

/// Reads configuration from `path`. A missing file is not an error: the
/// daemon starts with defaults, matching the "persisted state: none"
/// contract in the spec.
pub async fn read(path: &Path) -> Result<Config, Error> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(?path, "no configuration file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(Error::IO(e)),
    }
}
