//! Load node config from file and environment.

use std::path::{Path, PathBuf};

use badge_core::address::ParseAddressError;
use badge_core::{LinkConfig, MacAddress};
use serde::Deserialize;

use crate::radio::DEFAULT_RADIO_PORT;

/// Node configuration. File: ~/.config/badge-node/config.toml or /etc/badge-node/config.toml.
/// Env overrides: BADGE_NAME, BADGE_ADDRESS, BADGE_RADIO_PORT, BADGE_BEACON_INTERVAL_SECS.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name announced in beacons.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Hardware address as `aa:bb:cc:dd:ee:ff`. Random when absent.
    #[serde(default)]
    pub address: Option<String>,
    /// Multicast UDP port of the radio (default 45690).
    #[serde(default = "default_radio_port")]
    pub radio_port: u16,
    #[serde(default)]
    pub link: LinkConfig,
}

fn default_display_name() -> String {
    "badge".to_string()
}
fn default_radio_port() -> u16 {
    DEFAULT_RADIO_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            address: None,
            radio_port: default_radio_port(),
            link: LinkConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Address(#[from] ParseAddressError),
}

impl Config {
    /// Configured hardware address, or a fresh random one.
    pub fn address(&self) -> Result<MacAddress, ConfigError> {
        match &self.address {
            Some(s) => Ok(s.parse()?),
            None => Ok(MacAddress::random()),
        }
    }
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply overrides from `var`. Unparsable numbers are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("BADGE_NAME") {
        c.display_name = s;
    }
    if let Some(s) = var("BADGE_ADDRESS") {
        c.address = Some(s);
    }
    if let Some(p) = var("BADGE_RADIO_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.radio_port = p;
    }
    if let Some(secs) = var("BADGE_BEACON_INTERVAL_SECS").and_then(|s| s.parse::<u64>().ok()) {
        c.link.beacon_interval_secs = secs;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/badge-node/config.toml"));
    }
    out.push(PathBuf::from("/etc/badge-node/config.toml"));
    out
}
