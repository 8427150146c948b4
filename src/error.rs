//! Unified error types for the SR-IOV plugin

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for plugin operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Network option errors
    #[error("Invalid vlan id '{0}' (expected 0-4095)")]
    InvalidVlan(String),

    #[error("Vlan {vlan} already in use on device '{device}'")]
    VlanInUse { device: String, vlan: u16 },

    #[error("Network '{network}' already uses gateway {gateway}")]
    GatewayConflict { gateway: String, network: String },

    #[error("Invalid value '{value}' for option '{key}'")]
    InvalidOption { key: String, value: String },

    #[error("Missing required network option '{0}'")]
    MissingOption(&'static str),

    #[error("Network '{0}' already exists")]
    NetworkExists(String),

    #[error("Network '{0}' not found")]
    NetworkNotFound(String),

    // Endpoint errors
    #[error("Endpoint '{0}' already exists")]
    EndpointExists(String),

    #[error("Endpoint '{0}' not found")]
    EndpointNotFound(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    // Hardware errors
    #[error("Failed to initialize SR-IOV on '{device}': {message}")]
    HardwareInit { device: String, message: String },

    #[error("Invalid SR-IOV configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to allocate VF on '{device}': {message}")]
    VfAllocation { device: String, message: String },

    #[error("Failed to set privileged mode on VF {vf}: {message}")]
    PrivilegeConfig { vf: String, message: String },

    #[error("Failed to set vlan {vlan} on VF {vf}: {message}")]
    VlanConfig { vf: String, vlan: u16, message: String },

    #[error("Device '{0}' does not support SR-IOV")]
    SriovUnsupported(String),

    #[error("SR-IOV error: {0}")]
    Sriov(String),

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    // Transport errors
    #[error("Malformed plugin request: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for plugin operations
pub type Result<T> = std::result::Result<T, Error>;
