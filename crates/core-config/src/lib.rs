//! Configuration loading and parsing.
//!
//! Parses `parallax.toml` (or an override path provided by the binary),
//! extracting the proximity handler selection and the service timing knobs.
//! Unknown fields are ignored (TOML deserialization tolerance) to allow
//! forward evolution without immediate warnings; absent fields take the
//! documented defaults. Range clamping lives in `Config::sanitized` so a
//! hand-edited file can never produce a degenerate runtime (a zero poll
//! interval, a branching factor of one).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf};
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "parallax.toml";

fn default_handler() -> String {
    "rtree".to_owned()
}
fn default_rebuilding() -> bool {
    true
}
fn default_branching() -> u32 {
    10
}
fn default_rebuild_batch_size() -> u32 {
    10
}
fn default_rebuild_period_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxConfig {
    /// Factory type string: `brute`, `rtree`, `rtreedist`/`dist`,
    /// `rtreecut`, `rtreecutagg`, `level`.
    #[serde(default = "default_handler")]
    pub handler: String,
    #[serde(default = "default_rebuilding")]
    pub rebuilding: bool,
    #[serde(default = "default_branching")]
    pub branching: u32,
    #[serde(default = "default_rebuild_batch_size", rename = "rebuild-batch-size")]
    pub rebuild_batch_size: u32,
    #[serde(default = "default_rebuild_period_secs", rename = "rebuild-period-secs")]
    pub rebuild_period_secs: u64,
}

impl Default for ProxConfig {
    fn default() -> Self {
        Self {
            handler: default_handler(),
            rebuilding: default_rebuilding(),
            branching: default_branching(),
            rebuild_batch_size: default_rebuild_batch_size(),
            rebuild_period_secs: default_rebuild_period_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_poll_interval_ms", rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
    /// Artificial delay before applying parsed location updates, in seconds.
    /// Zero disables. Used by deterministic ingress tests.
    #[serde(default, rename = "delay-apply-loc-update")]
    pub delay_apply_loc_update_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            delay_apply_loc_update_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub prox: ProxConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

impl Config {
    /// Clamp out-of-range values, warning once per adjustment.
    pub fn sanitized(mut self) -> Self {
        if self.prox.branching < 2 {
            warn!(
                target: "config",
                branching = self.prox.branching,
                "branching below 2 clamped"
            );
            self.prox.branching = 2;
        }
        if self.prox.rebuild_batch_size == 0 {
            warn!(target: "config", "rebuild-batch-size of 0 clamped to 1");
            self.prox.rebuild_batch_size = 1;
        }
        if self.service.poll_interval_ms == 0 {
            warn!(target: "config", "poll-interval-ms of 0 clamped to 1");
            self.service.poll_interval_ms = 1;
        }
        self
    }
}

/// Parse a configuration file. Errors only on I/O or TOML syntax problems;
/// out-of-range values are clamped, unknown keys ignored.
pub fn load_from(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    info!(target: "config", path = %path.display(), "configuration loaded");
    Ok(config.sanitized())
}

/// Locate a config file: explicit override first, else `parallax.toml` in
/// the working directory, else defaults.
pub fn load_or_default(override_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = override_path {
        return load_from(path);
    }
    let discovered = PathBuf::from(CONFIG_FILE_NAME);
    if discovered.is_file() {
        return load_from(&discovered);
    }
    info!(target: "config", "no configuration file found, using defaults");
    Ok(Config::default())
}
