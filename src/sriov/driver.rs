//! SR-IOV network driver core
//!
//! Lock order is PF registry, then network map, then a network's endpoint
//! table. The registry lock serializes network creation and deletion along
//! with the PF enable/disable work they trigger. The network map lock is
//! only held for map reads and writes, never across hardware calls, so
//! endpoint operations are not held up by PF lifecycle work elsewhere.
//! Endpoint creation and deletion hold their network's endpoint table for
//! the whole VF bind or unbind.

use crate::error::{Error, Result};
use crate::hw::SriovControl;
use crate::manifest::{OptionParsing, PluginSettings, VlanPolicy};
use crate::sriov::device::{DeviceStatus, PfRegistry};
use crate::sriov::endpoint::{
    self, DST_PREFIX, EndpointInfo, EndpointInterface, EndpointRequest, JoinInfo, VfEndpoint,
};
use crate::sriov::network::{self, LogicalNetwork, NetworkOptions};
use crate::sriov::state::State;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

type NetworkMap = HashMap<String, Arc<LogicalNetwork>>;

/// SR-IOV network driver
pub struct SriovDriver {
    hw: Arc<dyn SriovControl>,
    vlan_policy: VlanPolicy,
    option_parsing: OptionParsing,
    devices: Mutex<PfRegistry>,
    networks: Mutex<NetworkMap>,
}

impl SriovDriver {
    /// Create a driver with default policies
    pub fn new(hw: Arc<dyn SriovControl>) -> Self {
        Self {
            hw,
            vlan_policy: VlanPolicy::default(),
            option_parsing: OptionParsing::default(),
            devices: Mutex::new(PfRegistry::new()),
            networks: Mutex::new(NetworkMap::new()),
        }
    }

    /// Create a driver with the policies from the plugin settings
    pub fn from_settings(hw: Arc<dyn SriovControl>, settings: &PluginSettings) -> Self {
        Self::new(hw)
            .with_vlan_policy(settings.vlan_policy)
            .with_option_parsing(settings.option_parsing)
    }

    pub fn with_vlan_policy(mut self, policy: VlanPolicy) -> Self {
        self.vlan_policy = policy;
        self
    }

    pub fn with_option_parsing(mut self, parsing: OptionParsing) -> Self {
        self.option_parsing = parsing;
        self
    }

    /// Name of the hardware backend
    pub fn backend(&self) -> &'static str {
        self.hw.name()
    }

    /// Create a logical network on a PF
    ///
    /// All validation happens before the PF is touched, so a rejected
    /// request leaves devices and networks as they were.
    pub fn create_network(
        &self,
        nid: &str,
        options: &NetworkOptions,
        gateway: Option<&str>,
    ) -> Result<()> {
        let mut devices = self.devices();

        let (device, vlan, privileged) = {
            let networks = self.networks();
            if networks.contains_key(nid) {
                return Err(Error::NetworkExists(nid.to_string()));
            }
            let device = options.require_device()?;

            if let Some(gateway) = gateway {
                if let Some(existing) = network::network_with_gateway(networks.values(), gateway) {
                    return Err(Error::GatewayConflict {
                        gateway: gateway.to_string(),
                        network: existing.id().to_string(),
                    });
                }
            }

            let vlan = options.parse_vlan(self.option_parsing)?;
            if network::vlan_in_use(networks.values(), device, vlan) {
                return Err(Error::VlanInUse {
                    device: device.to_string(),
                    vlan,
                });
            }
            (device, vlan, options.parse_privileged(self.option_parsing)?)
        };

        devices.ensure_enabled(self.hw.as_ref(), device)?;
        let handle = devices.handle(device)?;
        let refs = devices.add_reference(device)?;

        self.networks().insert(
            nid.to_string(),
            Arc::new(LogicalNetwork::new(
                nid,
                device,
                vlan,
                privileged,
                gateway.map(String::from),
                handle,
            )),
        );

        info!(network = %nid, pf = %device, vlan, privileged, refs, "Network created");
        Ok(())
    }

    /// Delete a logical network
    ///
    /// Endpoints still bound on the network have their VFs returned first.
    /// The PF is released afterwards and disabled when this was its last
    /// network. Hardware failures on the way are logged; the network is
    /// always removed. Unknown ids are ignored.
    pub fn delete_network(&self, nid: &str) -> Result<()> {
        let mut devices = self.devices();

        let Some(network) = self.networks().remove(nid) else {
            debug!(network = %nid, "Delete of unknown network ignored");
            return Ok(());
        };

        // Waits for endpoint binds still running on this network
        let mut table = network.table();
        table.closed = true;
        for (eid, ep) in table.endpoints.drain() {
            debug!(network = %nid, endpoint = %eid, "Releasing endpoint of deleted network");
            if let Err(e) = endpoint::unbind_vf(self.hw.as_ref(), network.handle(), &ep.vf, network.vlan()) {
                warn!(network = %nid, endpoint = %eid, error = %e, "Failed to release VF");
            }
        }
        drop(table);

        match devices.release(self.hw.as_ref(), network.device()) {
            Ok(true) => info!(network = %nid, pf = %network.device(), "Last network on PF removed"),
            Ok(false) => {}
            Err(e) => warn!(network = %nid, pf = %network.device(), error = %e, "Failed to disable SR-IOV"),
        }

        info!(network = %nid, "Network deleted");
        Ok(())
    }

    /// Bind a VF to a new endpoint
    ///
    /// The endpoint table stays locked until the endpoint is recorded, so the
    /// network cannot be torn down under a bind in progress.
    pub fn create_endpoint(
        &self,
        nid: &str,
        eid: &str,
        request: &EndpointRequest,
    ) -> Result<EndpointInterface> {
        let network = self.network(nid)?;

        let mut table = network.table();
        if table.closed {
            return Err(Error::NetworkNotFound(nid.to_string()));
        }
        if table.endpoints.contains_key(eid) {
            return Err(Error::EndpointExists(eid.to_string()));
        }

        let vf = endpoint::bind_vf(
            self.hw.as_ref(),
            network.handle(),
            network.vlan(),
            network.privileged(),
            request.mac.as_ref(),
            self.vlan_policy,
        )?;

        let ep = VfEndpoint::new(vf, request);
        let interface = ep.interface(request);
        info!(network = %nid, endpoint = %eid, netdev = %ep.netdev(), "Endpoint created");
        table.endpoints.insert(eid.to_string(), ep);
        Ok(interface)
    }

    /// Return an endpoint's VF to the pool
    ///
    /// Unknown networks and endpoints are ignored.
    pub fn delete_endpoint(&self, nid: &str, eid: &str) -> Result<()> {
        let Ok(network) = self.network(nid) else {
            debug!(network = %nid, endpoint = %eid, "Delete of endpoint on unknown network ignored");
            return Ok(());
        };

        let mut table = network.table();
        let Some(ep) = table.endpoints.remove(eid) else {
            debug!(network = %nid, endpoint = %eid, "Delete of unknown endpoint ignored");
            return Ok(());
        };

        endpoint::unbind_vf(self.hw.as_ref(), network.handle(), &ep.vf, network.vlan())?;
        info!(network = %nid, endpoint = %eid, "Endpoint deleted");
        Ok(())
    }

    /// Interface details for moving the endpoint into a sandbox
    pub fn join(&self, nid: &str, eid: &str) -> Result<JoinInfo> {
        let network = self.network(nid)?;
        let table = network.table();
        let ep = table
            .endpoints
            .get(eid)
            .ok_or_else(|| Error::EndpointNotFound(eid.to_string()))?;

        debug!(network = %nid, endpoint = %eid, netdev = %ep.netdev(), "Endpoint joined");
        Ok(JoinInfo {
            src_name: ep.netdev().to_string(),
            dst_prefix: DST_PREFIX.to_string(),
            gateway: network.gateway_address().map(String::from),
        })
    }

    /// Counterpart of `join`; the VF stays bound until the endpoint is deleted
    pub fn leave(&self, nid: &str, eid: &str) -> Result<()> {
        let network = self.network(nid)?;
        if !network.table().endpoints.contains_key(eid) {
            return Err(Error::EndpointNotFound(eid.to_string()));
        }
        debug!(network = %nid, endpoint = %eid, "Endpoint left");
        Ok(())
    }

    /// Operational details of an endpoint
    pub fn endpoint_info(&self, nid: &str, eid: &str) -> Result<EndpointInfo> {
        let network = self.network(nid)?;
        let table = network.table();
        let ep = table
            .endpoints
            .get(eid)
            .ok_or_else(|| Error::EndpointNotFound(eid.to_string()))?;

        Ok(EndpointInfo {
            pf: network.device().to_string(),
            vlan: network.vlan(),
            vf_index: ep.vf.index,
            netdev: ep.vf.netdev.clone(),
            mac: ep.vf.mac,
            pci_address: ep.vf.pci_address.clone(),
        })
    }

    /// Look up a network by id
    pub fn network(&self, nid: &str) -> Result<Arc<LogicalNetwork>> {
        self.networks()
            .get(nid)
            .cloned()
            .ok_or_else(|| Error::NetworkNotFound(nid.to_string()))
    }

    pub fn network_count(&self) -> usize {
        self.networks().len()
    }

    /// Number of networks using a PF
    #[allow(dead_code)]
    pub fn ref_count(&self, pf: &str) -> usize {
        self.devices().ref_count(pf)
    }

    /// Lifecycle state of a PF, `None` when not under control
    #[allow(dead_code)]
    pub fn device_state(&self, pf: &str) -> Option<State> {
        self.devices().get(pf).map(|d| d.state())
    }

    /// Status of every PF under control
    pub fn device_status(&self) -> Vec<DeviceStatus> {
        self.devices().status()
    }

    fn devices(&self) -> MutexGuard<'_, PfRegistry> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn networks(&self) -> MutexGuard<'_, NetworkMap> {
        self.networks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
