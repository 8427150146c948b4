//! Simulated SR-IOV backend
//!
//! Keeps PF and VF state in memory. Used by the test-suite and by
//! `backend = "simulated"` to run the plugin on hosts without SR-IOV NICs.
//! Faults can be injected per PF to exercise the error paths.

use crate::error::{Error, Result};
use crate::hw::{MacAddress, PfHandle, SriovControl, VfHandle};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    EnableSriov,
    DisableSriov,
    PfHandle,
    ConfigureVfs,
    SetVlan,
    SetPrivileged,
}

#[derive(Debug, Clone, Default)]
struct SimVf {
    mac: Option<MacAddress>,
    vlan: u16,
    privileged: bool,
}

#[derive(Debug)]
struct SimPf {
    ordinal: u8,
    total_vfs: u32,
    enabled: bool,
    enable_count: u32,
    vfs: Vec<SimVf>,
}

#[derive(Debug, Default)]
struct SimState {
    pfs: HashMap<String, SimPf>,
    faults: HashSet<(String, Fault)>,
}

/// In-memory SR-IOV hardware
#[derive(Debug, Default)]
pub struct SimulatedSriov {
    state: Mutex<SimState>,
}

impl SimulatedSriov {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an SR-IOV capable PF with `total_vfs` VFs
    ///
    /// VF n of the k-th declared PF gets MAC 02:00:00:00:<k>:<n>.
    pub fn with_pf(self, name: &str, total_vfs: u32) -> Self {
        {
            let mut state = self.lock();
            let ordinal = state.pfs.len() as u8;
            state.pfs.insert(
                name.to_string(),
                SimPf {
                    ordinal,
                    total_vfs,
                    enabled: false,
                    enable_count: 0,
                    vfs: Vec::new(),
                },
            );
        }
        self
    }

    /// Make the next and all following calls of `fault` on `pf` fail
    pub fn inject(&self, pf: &str, fault: Fault) {
        self.lock().faults.insert((pf.to_string(), fault));
    }

    /// Remove a previously injected fault
    pub fn clear(&self, pf: &str, fault: Fault) {
        self.lock().faults.remove(&(pf.to_string(), fault));
    }

    /// Whether SR-IOV is currently enabled on `pf`
    pub fn is_enabled(&self, pf: &str) -> bool {
        self.lock().pfs.get(pf).is_some_and(|p| p.enabled)
    }

    /// How many times SR-IOV has been enabled on `pf`
    pub fn enable_count(&self, pf: &str) -> u32 {
        self.lock().pfs.get(pf).map_or(0, |p| p.enable_count)
    }

    /// VLAN currently programmed on a VF
    pub fn vf_vlan(&self, pf: &str, index: u32) -> Option<u16> {
        self.lock()
            .pfs
            .get(pf)
            .and_then(|p| p.vfs.get(index as usize))
            .map(|vf| vf.vlan)
    }

    /// Trust flag currently programmed on a VF
    pub fn vf_privileged(&self, pf: &str, index: u32) -> Option<bool> {
        self.lock()
            .pfs
            .get(pf)
            .and_then(|p| p.vfs.get(index as usize))
            .map(|vf| vf.privileged)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_fault(state: &SimState, pf: &str, fault: Fault) -> Result<()> {
        if state.faults.contains(&(pf.to_string(), fault)) {
            return Err(Error::Sriov(format!("injected {:?} failure on {}", fault, pf)));
        }
        Ok(())
    }

    fn pf_mut<'a>(state: &'a mut SimState, pf: &str) -> Result<&'a mut SimPf> {
        state
            .pfs
            .get_mut(pf)
            .ok_or_else(|| Error::SriovUnsupported(pf.to_string()))
    }

    fn vf_mut<'a>(state: &'a mut SimState, pf: &str, index: u32) -> Result<&'a mut SimVf> {
        Self::pf_mut(state, pf)?
            .vfs
            .get_mut(index as usize)
            .ok_or_else(|| Error::Sriov(format!("VF {} not present on {}", index, pf)))
    }
}

impl SriovControl for SimulatedSriov {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn enable_sriov(&self, pf: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_fault(&state, pf, Fault::EnableSriov)?;

        let dev = Self::pf_mut(&mut state, pf)?;
        if !dev.enabled {
            let ordinal = dev.ordinal;
            dev.vfs = (0..dev.total_vfs)
                .map(|i| SimVf {
                    mac: Some(MacAddress::new([0x02, 0, 0, 0, ordinal, i as u8])),
                    ..Default::default()
                })
                .collect();
            dev.enabled = true;
            dev.enable_count += 1;
        }
        debug!(pf = %pf, vfs = dev.total_vfs, "Simulated SR-IOV enabled");
        Ok(())
    }

    fn disable_sriov(&self, pf: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_fault(&state, pf, Fault::DisableSriov)?;

        let dev = Self::pf_mut(&mut state, pf)?;
        dev.enabled = false;
        dev.vfs.clear();
        debug!(pf = %pf, "Simulated SR-IOV disabled");
        Ok(())
    }

    fn pf_handle(&self, pf: &str) -> Result<PfHandle> {
        let mut state = self.lock();
        Self::check_fault(&state, pf, Fault::PfHandle)?;

        let dev = Self::pf_mut(&mut state, pf)?;
        if !dev.enabled {
            return Err(Error::Sriov(format!("SR-IOV is not enabled on {}", pf)));
        }

        let vfs = dev
            .vfs
            .iter()
            .enumerate()
            .map(|(i, vf)| VfHandle {
                index: i as u32,
                netdev: format!("{}v{}", pf, i),
                mac: vf.mac,
                pci_address: None,
            })
            .collect();
        Ok(PfHandle::new(pf, vfs))
    }

    fn configure_vfs(&self, handle: &mut PfHandle) -> Result<()> {
        let state = self.lock();
        Self::check_fault(&state, handle.name(), Fault::ConfigureVfs)
    }

    fn set_vf_vlan(&self, handle: &PfHandle, vf: &VfHandle, vlan: u16) -> Result<()> {
        let mut state = self.lock();
        Self::check_fault(&state, handle.name(), Fault::SetVlan)?;
        Self::vf_mut(&mut state, handle.name(), vf.index)?.vlan = vlan;
        Ok(())
    }

    fn set_vf_privileged(&self, handle: &PfHandle, vf: &VfHandle, privileged: bool) -> Result<()> {
        let mut state = self.lock();
        Self::check_fault(&state, handle.name(), Fault::SetPrivileged)?;
        Self::vf_mut(&mut state, handle.name(), vf.index)?.privileged = privileged;
        Ok(())
    }
}
