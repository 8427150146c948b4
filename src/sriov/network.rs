//! Logical networks
//!
//! A logical network is what the container runtime sees as a network: one PF,
//! an optional VLAN tag, a privilege flag, and the endpoints bound on it.

use crate::error::{Error, Result};
use crate::hw::PfHandle;
use crate::manifest::OptionParsing;
use crate::sriov::endpoint::VfEndpoint;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Option key naming the backing PF
pub const OPT_DEVICE: &str = "netdevice";
/// Option key carrying the VLAN id
pub const OPT_VLAN: &str = "vlan";
/// Option key carrying the privilege flag
pub const OPT_PRIVILEGED: &str = "privileged";

/// Highest valid 802.1Q VLAN id
pub const MAX_VLAN: u16 = 4095;

/// Raw, string-encoded network options as received from the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOptions {
    pub device: Option<String>,
    pub vlan: Option<String>,
    pub privileged: Option<String>,
}

impl NetworkOptions {
    /// Build from a key/value map
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let get = |key: &str| {
            map.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            device: get(OPT_DEVICE),
            vlan: get(OPT_VLAN),
            privileged: get(OPT_PRIVILEGED),
        }
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn vlan(mut self, vlan: impl Into<String>) -> Self {
        self.vlan = Some(vlan.into());
        self
    }

    pub fn privileged(mut self, privileged: impl Into<String>) -> Self {
        self.privileged = Some(privileged.into());
        self
    }

    /// PF name, required
    pub fn require_device(&self) -> Result<&str> {
        self.device.as_deref().ok_or(Error::MissingOption(OPT_DEVICE))
    }

    /// Parse and range-check the VLAN id; absent means untagged
    pub fn parse_vlan(&self, parsing: OptionParsing) -> Result<u16> {
        let Some(raw) = self.vlan.as_deref() else {
            return Ok(0);
        };

        let value = match raw.parse::<i64>() {
            Ok(v) => v,
            Err(_) => match parsing {
                OptionParsing::Strict => return Err(Error::InvalidVlan(raw.to_string())),
                OptionParsing::Lenient => 0,
            },
        };

        if !(0..=i64::from(MAX_VLAN)).contains(&value) {
            return Err(Error::InvalidVlan(raw.to_string()));
        }
        Ok(value as u16)
    }

    /// Parse the privilege flag; absent means unprivileged
    ///
    /// Accepts integers (non-zero is privileged) and true/false.
    pub fn parse_privileged(&self, parsing: OptionParsing) -> Result<bool> {
        let Some(raw) = self.privileged.as_deref() else {
            return Ok(false);
        };

        if let Ok(n) = raw.parse::<i64>() {
            return Ok(n > 0);
        }
        match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" => Ok(true),
            "false" | "no" | "off" => Ok(false),
            _ => match parsing {
                OptionParsing::Strict => Err(Error::InvalidOption {
                    key: OPT_PRIVILEGED.to_string(),
                    value: raw.to_string(),
                }),
                OptionParsing::Lenient => Ok(false),
            },
        }
    }
}

/// Endpoint table of a network
///
/// `closed` is set when the network is being deleted; no endpoint may be
/// added afterwards. Endpoint creation holds the table across the VF bind,
/// so closing it waits for binds already in flight.
#[derive(Debug, Default)]
pub struct EndpointTable {
    pub(crate) endpoints: HashMap<String, VfEndpoint>,
    pub(crate) closed: bool,
}

/// A runtime-visible network backed by one PF
#[derive(Debug)]
pub struct LogicalNetwork {
    /// Network id assigned by the runtime
    id: String,
    /// Backing PF name
    device: String,
    /// VLAN id, 0 for untagged
    vlan: u16,
    /// Whether VFs get trust on / spoof check off
    privileged: bool,
    /// Gateway handed out by IPAM, as received (may carry a prefix)
    gateway: Option<String>,
    /// VF pool of the backing PF
    handle: Arc<PfHandle>,
    /// Endpoints bound on this network
    endpoints: Mutex<EndpointTable>,
}

impl LogicalNetwork {
    pub fn new(
        id: impl Into<String>,
        device: impl Into<String>,
        vlan: u16,
        privileged: bool,
        gateway: Option<String>,
        handle: Arc<PfHandle>,
    ) -> Self {
        Self {
            id: id.into(),
            device: device.into(),
            vlan,
            privileged,
            gateway,
            handle,
            endpoints: Mutex::new(EndpointTable::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn vlan(&self) -> u16 {
        self.vlan
    }

    pub fn privileged(&self) -> bool {
        self.privileged
    }

    pub fn gateway(&self) -> Option<&str> {
        self.gateway.as_deref()
    }

    pub fn handle(&self) -> &Arc<PfHandle> {
        &self.handle
    }

    /// Gateway address without its prefix length
    pub fn gateway_address(&self) -> Option<&str> {
        self.gateway
            .as_deref()
            .map(|g| g.split('/').next().unwrap_or(g))
    }

    /// Number of endpoints currently bound
    pub fn endpoint_count(&self) -> usize {
        self.table().endpoints.len()
    }

    pub(crate) fn table(&self) -> MutexGuard<'_, EndpointTable> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Find a live network already using `gateway`
pub fn network_with_gateway<'a>(
    networks: impl IntoIterator<Item = &'a Arc<LogicalNetwork>>,
    gateway: &str,
) -> Option<&'a Arc<LogicalNetwork>> {
    let wanted = gateway.split('/').next().unwrap_or(gateway);
    networks
        .into_iter()
        .find(|nw| nw.gateway_address() == Some(wanted))
}

/// Whether `vlan` is already taken on `device`
///
/// Untagged networks never collide.
pub fn vlan_in_use<'a>(
    networks: impl IntoIterator<Item = &'a Arc<LogicalNetwork>>,
    device: &str,
    vlan: u16,
) -> bool {
    if vlan == 0 {
        return false;
    }
    networks
        .into_iter()
        .any(|nw| nw.vlan == vlan && nw.device == device)
}
