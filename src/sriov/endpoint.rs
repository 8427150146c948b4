//! VF endpoints
//!
//! Binding a VF to an endpoint means taking it out of the PF pool and
//! programming it for the endpoint's network. Any failure after the VF left
//! the pool puts it back before the error is returned.

use crate::error::{Error, Result};
use crate::hw::{MacAddress, PfHandle, SriovControl, VfHandle};
use crate::manifest::VlanPolicy;
use tracing::{debug, warn};

/// Interface prefix inside the container; the runtime appends an index
pub const DST_PREFIX: &str = "eth";

/// Addressing requested by the runtime for a new endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointRequest {
    /// IPv4 address in CIDR notation
    pub address: Option<String>,
    /// IPv6 address in CIDR notation
    pub address_ipv6: Option<String>,
    /// MAC of the VF to bind
    pub mac: Option<MacAddress>,
}

/// A VF bound to an endpoint
#[derive(Debug, Clone)]
pub struct VfEndpoint {
    /// The VF taken from the pool
    pub vf: VfHandle,
    /// Requested IPv4 address
    pub address: Option<String>,
    /// Requested IPv6 address
    pub address_ipv6: Option<String>,
    /// MAC the runtime asked for, if any
    pub requested_mac: Option<MacAddress>,
}

impl VfEndpoint {
    pub fn new(vf: VfHandle, request: &EndpointRequest) -> Self {
        Self {
            vf,
            address: request.address.clone(),
            address_ipv6: request.address_ipv6.clone(),
            requested_mac: request.mac,
        }
    }

    /// Host netdev of the bound VF
    pub fn netdev(&self) -> &str {
        &self.vf.netdev
    }

    /// Interface fields handed back to the runtime
    ///
    /// The address is only reported when the runtime did not pick one itself.
    /// The MAC stays unset.
    pub fn interface(&self, request: &EndpointRequest) -> EndpointInterface {
        EndpointInterface {
            address: match request.address {
                Some(_) => None,
                None => self.address.clone(),
            },
            mac_address: None,
        }
    }
}

/// Interface fields of a create-endpoint answer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInterface {
    pub address: Option<String>,
    pub mac_address: Option<String>,
}

/// What the runtime needs to move the VF into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    /// Host netdev to move into the sandbox
    pub src_name: String,
    /// Name prefix inside the sandbox
    pub dst_prefix: String,
    /// Default gateway, without prefix length
    pub gateway: Option<String>,
}

/// Operational details of an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub pf: String,
    pub vlan: u16,
    pub vf_index: u32,
    pub netdev: String,
    pub mac: Option<MacAddress>,
    pub pci_address: Option<String>,
}

/// Take a VF from the pool and program it
///
/// VLAN tagging only happens for tagged networks. Under `VlanPolicy::Strict`
/// a tagging failure frees the VF and fails with `VlanConfig`; under
/// `BestEffort` it is logged and the VF is kept. The privilege flag is always
/// applied and a failure there frees the VF.
pub fn bind_vf(
    hw: &dyn SriovControl,
    handle: &PfHandle,
    vlan: u16,
    privileged: bool,
    requested_mac: Option<&MacAddress>,
    policy: VlanPolicy,
) -> Result<VfHandle> {
    let vf = match requested_mac {
        Some(mac) => hw.allocate_vf_by_mac(handle, mac),
        None => hw.allocate_vf(handle),
    }
    .map_err(|e| match e {
        Error::VfAllocation { .. } => e,
        other => Error::VfAllocation {
            device: handle.name().to_string(),
            message: other.to_string(),
        },
    })?;

    if vlan > 0 {
        if let Err(e) = hw.set_vf_vlan(handle, &vf, vlan) {
            match policy {
                VlanPolicy::Strict => {
                    release_after_failure(hw, handle, &vf);
                    return Err(Error::VlanConfig {
                        vf: vf.netdev.clone(),
                        vlan,
                        message: e.to_string(),
                    });
                }
                VlanPolicy::BestEffort => {
                    warn!(pf = %handle.name(), vf = %vf.netdev, vlan, error = %e, "Failed to tag VF, continuing untagged");
                }
            }
        }
    }

    if let Err(e) = hw.set_vf_privileged(handle, &vf, privileged) {
        release_after_failure(hw, handle, &vf);
        return Err(Error::PrivilegeConfig {
            vf: vf.netdev.clone(),
            message: e.to_string(),
        });
    }

    debug!(pf = %handle.name(), vf = vf.index, netdev = %vf.netdev, vlan, privileged, "VF bound");
    Ok(vf)
}

/// Return a VF to the pool
///
/// A tagged VF is reset to untagged first so the next network starts clean;
/// failing to do so is only logged.
pub fn unbind_vf(hw: &dyn SriovControl, handle: &PfHandle, vf: &VfHandle, vlan: u16) -> Result<()> {
    if vlan > 0 {
        if let Err(e) = hw.set_vf_vlan(handle, vf, 0) {
            warn!(pf = %handle.name(), vf = %vf.netdev, error = %e, "Failed to clear VF VLAN");
        }
    }
    hw.free_vf(handle, vf)?;
    debug!(pf = %handle.name(), vf = vf.index, "VF returned to pool");
    Ok(())
}

fn release_after_failure(hw: &dyn SriovControl, handle: &PfHandle, vf: &VfHandle) {
    if let Err(e) = hw.free_vf(handle, vf) {
        warn!(pf = %handle.name(), vf = %vf.netdev, error = %e, "Failed to return VF to pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{Fault, SimulatedSriov};

    fn setup(vfs: u32) -> (SimulatedSriov, PfHandle) {
        let hw = SimulatedSriov::new().with_pf("eth10", vfs);
        hw.enable_sriov("eth10").unwrap();
        let handle = hw.pf_handle("eth10").unwrap();
        (hw, handle)
    }

    #[test]
    fn test_bind_programs_vf() {
        let (hw, handle) = setup(2);

        let vf = bind_vf(&hw, &handle, 100, true, None, VlanPolicy::Strict).unwrap();
        assert!(handle.is_allocated(vf.index));
        assert_eq!(hw.vf_vlan("eth10", vf.index), Some(100));
        assert_eq!(hw.vf_privileged("eth10", vf.index), Some(true));
    }

    #[test]
    fn test_bind_by_mac() {
        let (hw, handle) = setup(4);
        let mac = MacAddress::new([0x02, 0, 0, 0, 0, 3]);

        let vf = bind_vf(&hw, &handle, 0, false, Some(&mac), VlanPolicy::Strict).unwrap();
        assert_eq!(vf.index, 3);
        assert_eq!(vf.mac, Some(mac));
    }

    #[test]
    fn test_bind_unknown_mac() {
        let (hw, handle) = setup(2);
        let mac = MacAddress::new([0x02, 0xaa, 0, 0, 0, 1]);

        let err = bind_vf(&hw, &handle, 0, false, Some(&mac), VlanPolicy::Strict).unwrap_err();
        assert!(matches!(err, Error::VfAllocation { .. }));
        assert_eq!(handle.free_vfs(), 2);
    }

    #[test]
    fn test_privilege_failure_frees_vf() {
        let (hw, handle) = setup(1);
        hw.inject("eth10", Fault::SetPrivileged);

        let err = bind_vf(&hw, &handle, 0, true, None, VlanPolicy::Strict).unwrap_err();
        assert!(matches!(err, Error::PrivilegeConfig { .. }));
        assert_eq!(handle.free_vfs(), 1);
    }

    #[test]
    fn test_vlan_failure_strict() {
        let (hw, handle) = setup(1);
        hw.inject("eth10", Fault::SetVlan);

        let err = bind_vf(&hw, &handle, 100, false, None, VlanPolicy::Strict).unwrap_err();
        assert!(matches!(err, Error::VlanConfig { vlan: 100, .. }));
        assert_eq!(handle.free_vfs(), 1);
    }

    #[test]
    fn test_vlan_failure_best_effort() {
        let (hw, handle) = setup(1);
        hw.inject("eth10", Fault::SetVlan);

        let vf = bind_vf(&hw, &handle, 100, false, None, VlanPolicy::BestEffort).unwrap();
        assert!(handle.is_allocated(vf.index));
        assert_eq!(hw.vf_vlan("eth10", vf.index), Some(0));
    }

    #[test]
    fn test_untagged_network_skips_vlan() {
        let (hw, handle) = setup(1);
        // Would fail if tagging were attempted
        hw.inject("eth10", Fault::SetVlan);

        assert!(bind_vf(&hw, &handle, 0, false, None, VlanPolicy::Strict).is_ok());
    }

    #[test]
    fn test_unbind_clears_vlan() {
        let (hw, handle) = setup(1);
        let vf = bind_vf(&hw, &handle, 300, false, None, VlanPolicy::Strict).unwrap();

        unbind_vf(&hw, &handle, &vf, 300).unwrap();
        assert_eq!(handle.free_vfs(), 1);
        assert_eq!(hw.vf_vlan("eth10", vf.index), Some(0));
    }

    #[test]
    fn test_interface_reports_address_only_when_not_requested() {
        let vf = VfHandle {
            index: 0,
            netdev: "eth10v0".into(),
            mac: None,
            pci_address: None,
        };

        let requested = EndpointRequest {
            address: Some("10.0.0.5/24".into()),
            ..Default::default()
        };
        let endpoint = VfEndpoint::new(vf.clone(), &requested);
        assert_eq!(endpoint.interface(&requested), EndpointInterface::default());

        let mut endpoint = VfEndpoint::new(vf, &EndpointRequest::default());
        endpoint.address = Some("10.0.0.9/24".into());
        let iface = endpoint.interface(&EndpointRequest::default());
        assert_eq!(iface.address.as_deref(), Some("10.0.0.9/24"));
        assert_eq!(iface.mac_address, None);
    }
}
