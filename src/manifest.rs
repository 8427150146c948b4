//! Configuration file parsing for the SR-IOV plugin
//!
//! Parses `sriov-plugin.toml` configuration files using serde. Every field has
//! a default, so the file itself is optional.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sriov-plugin/sriov-plugin.toml";

/// Load configuration from a file
pub fn load(path: &Path) -> Result<PluginConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: PluginConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Load the configuration at `path`, or the default location
///
/// An explicitly given path must exist. The default location is optional and
/// falls back to built-in defaults when absent.
pub fn load_or_default(path: Option<&Path>) -> Result<PluginConfig> {
    match path {
        Some(path) => load(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load(default)
            } else {
                Ok(PluginConfig::default())
            }
        }
    }
}

/// Root configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct PluginConfig {
    /// Plugin and driver settings
    #[serde(default)]
    pub plugin: PluginSettings,

    /// VF discovery retry settings (sysfs backend)
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// PFs exposed by the simulated backend
    #[serde(default)]
    pub simulated: Vec<SimulatedPf>,
}

impl PluginConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.plugin.name.is_empty() || self.plugin.name.contains('/') {
            return Err(Error::ConfigValidation(format!(
                "Invalid plugin name '{}'",
                self.plugin.name
            )));
        }

        if self.discovery.max_attempts == 0 {
            return Err(Error::ConfigValidation(
                "discovery.max_attempts must be at least 1".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.discovery.jitter_factor) {
            return Err(Error::ConfigValidation(format!(
                "discovery.jitter_factor must be within 0.0-1.0, got {}",
                self.discovery.jitter_factor
            )));
        }

        let mut names = HashSet::new();
        for pf in &self.simulated {
            if !names.insert(&pf.name) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate simulated device: {}",
                    pf.name
                )));
            }
            if pf.vfs == 0 || pf.vfs > 256 {
                return Err(Error::ConfigValidation(format!(
                    "Simulated device '{}' must have 1-256 VFs",
                    pf.name
                )));
            }
        }

        if self.plugin.backend == Backend::Simulated && self.simulated.is_empty() {
            return Err(Error::ConfigValidation(
                "Simulated backend selected but no [[simulated]] devices declared".into(),
            ));
        }

        Ok(())
    }

    /// Full path of the plugin socket
    pub fn socket_path(&self) -> PathBuf {
        self.plugin
            .socket_dir
            .join(format!("{}.sock", self.plugin.name))
    }
}

/// Hardware backend driving the PFs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Linux sysfs + iproute2
    #[default]
    Sysfs,
    /// In-memory devices from `[[simulated]]`
    Simulated,
}

/// What to do when tagging a VF with its network's VLAN fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VlanPolicy {
    /// Free the VF and fail the endpoint
    #[default]
    Strict,
    /// Log and keep the untagged VF
    BestEffort,
}

/// How unparsable `vlan` / `privileged` network options are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptionParsing {
    /// Reject the network with a typed error
    #[default]
    Strict,
    /// Treat the value as 0
    Lenient,
}

fn default_name() -> String {
    "sriov".into()
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/run/docker/plugins")
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_ip_command() -> String {
    "ip".into()
}

fn default_log_level() -> String {
    "info".into()
}

/// Plugin and driver settings
#[derive(Debug, Clone, Deserialize)]
pub struct PluginSettings {
    /// Plugin name; the socket is `<socket_dir>/<name>.sock`
    #[serde(default = "default_name")]
    pub name: String,

    /// Directory Docker scans for plugin sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Hardware backend
    #[serde(default)]
    pub backend: Backend,

    /// Mount point of sysfs
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// iproute2 binary used for VF configuration
    #[serde(default = "default_ip_command")]
    pub ip_command: String,

    /// VLAN tagging failure policy
    #[serde(default)]
    pub vlan_policy: VlanPolicy,

    /// Network option parsing policy
    #[serde(default)]
    pub option_parsing: OptionParsing,

    /// Default log level (overridden by RUST_LOG and --debug)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            socket_dir: default_socket_dir(),
            backend: Backend::default(),
            sysfs_root: default_sysfs_root(),
            ip_command: default_ip_command(),
            vlan_policy: VlanPolicy::default(),
            option_parsing: OptionParsing::default(),
            log_level: default_log_level(),
        }
    }
}

// Discovery retry defaults
fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    8
}

fn default_jitter_factor() -> f64 {
    0.25
}

/// Retry/backoff configuration for VF discovery
///
/// VF netdevs show up asynchronously after SR-IOV is enabled, so the sysfs
/// backend polls for them with exponential backoff.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Base delay in milliseconds before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between retries
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0-1.0) to randomize delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// A PF exposed by the simulated backend
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedPf {
    /// PF netdev name (e.g., "eth10")
    pub name: String,

    /// Number of VFs
    pub vfs: u32,
}
