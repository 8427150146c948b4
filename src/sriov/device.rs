//! PF device registry
//!
//! Tracks every PF under SR-IOV control: its hardware handle, lifecycle state
//! and how many logical networks currently ride on it. The registry itself is
//! not synchronized; the driver serializes access to it.

use crate::error::{Error, Result};
use crate::hw::{PfHandle, SriovControl};
use crate::sriov::state::{DynamicPfMachine, PfMachine, PfMachineEvent, State};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A PF under SR-IOV control
pub struct PfDevice {
    /// PF netdev name
    name: String,
    /// Lifecycle state machine
    machine: DynamicPfMachine<()>,
    /// Handle, present while Enabled
    handle: Option<Arc<PfHandle>>,
    /// Number of logical networks using this PF
    ref_count: usize,
}

impl PfDevice {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            machine: PfMachine::new(()).into_dynamic(),
            handle: None,
            ref_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current state as enum
    pub fn state(&self) -> State {
        State::from_str(self.machine.current_state())
    }

    pub fn handle(&self) -> Option<&Arc<PfHandle>> {
        self.handle.as_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Enable SR-IOV, acquire the handle and configure the VF pool
    fn initialize(&mut self, hw: &dyn SriovControl) -> Result<()> {
        hw.enable_sriov(&self.name)?;

        let handle = match hw
            .pf_handle(&self.name)
            .and_then(|mut handle| hw.configure_vfs(&mut handle).map(|_| handle))
        {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(rollback) = hw.disable_sriov(&self.name) {
                    warn!(pf = %self.name, error = %rollback, "Failed to roll back SR-IOV enable");
                }
                return Err(e);
            }
        };

        self.machine
            .handle(PfMachineEvent::Enable)
            .map_err(|e| Error::Sriov(format!("{}: invalid enable transition: {:?}", self.name, e)))?;

        debug!(pf = %self.name, vfs = handle.total_vfs(), "VF pool configured");
        self.handle = Some(Arc::new(handle));
        Ok(())
    }
}

/// Status snapshot of a PF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub name: String,
    pub state: State,
    pub ref_count: usize,
    pub total_vfs: usize,
    pub free_vfs: usize,
}

/// Registry of PFs under SR-IOV control
#[derive(Default)]
pub struct PfRegistry {
    devices: HashMap<String, PfDevice>,
}

impl PfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring a PF to Enabled, creating its entry on first use
    ///
    /// Idempotent for PFs already present. On failure no entry is published
    /// and SR-IOV is rolled back.
    pub fn ensure_enabled(&mut self, hw: &dyn SriovControl, pf: &str) -> Result<&PfDevice> {
        if !self.devices.contains_key(pf) {
            let mut device = PfDevice::new(pf);
            device.initialize(hw).map_err(|e| Error::HardwareInit {
                device: pf.to_string(),
                message: e.to_string(),
            })?;

            info!(pf = %pf, backend = hw.name(), "PF enabled");
            self.devices.insert(pf.to_string(), device);
        }

        self.devices
            .get(pf)
            .ok_or_else(|| Error::InvalidConfiguration(format!("PF '{}' vanished", pf)))
    }

    /// Record one more logical network on the PF
    pub fn add_reference(&mut self, pf: &str) -> Result<usize> {
        let device = self
            .devices
            .get_mut(pf)
            .ok_or_else(|| Error::InvalidConfiguration(format!("PF '{}' is not enabled", pf)))?;
        device.ref_count += 1;
        debug!(pf = %pf, refs = device.ref_count, "PF reference added");
        Ok(device.ref_count)
    }

    /// Drop one logical network from the PF
    ///
    /// Returns whether the PF was disabled and removed. When the count reaches
    /// zero the entry is removed even if disabling SR-IOV fails; that error is
    /// returned for the caller to report.
    pub fn release(&mut self, hw: &dyn SriovControl, pf: &str) -> Result<bool> {
        let Some(device) = self.devices.get_mut(pf) else {
            warn!(pf = %pf, "Release of unknown PF ignored");
            return Ok(false);
        };

        device.ref_count = device.ref_count.saturating_sub(1);
        debug!(pf = %pf, refs = device.ref_count, "PF reference released");
        if device.ref_count > 0 {
            return Ok(false);
        }

        let mut device = match self.devices.remove(pf) {
            Some(device) => device,
            None => return Ok(false),
        };
        device.handle = None;
        if let Err(e) = device.machine.handle(PfMachineEvent::Disable) {
            warn!(pf = %pf, error = ?e, "Unexpected PF state on disable");
        }

        hw.disable_sriov(pf)?;
        info!(pf = %pf, "PF disabled");
        Ok(true)
    }

    /// Handle of an enabled PF
    pub fn handle(&self, pf: &str) -> Result<Arc<PfHandle>> {
        self.devices
            .get(pf)
            .and_then(|d| d.handle.clone())
            .ok_or_else(|| Error::InvalidConfiguration(format!("PF '{}' has no SR-IOV handle", pf)))
    }

    pub fn get(&self, pf: &str) -> Option<&PfDevice> {
        self.devices.get(pf)
    }

    /// Reference count of a PF, 0 when absent
    pub fn ref_count(&self, pf: &str) -> usize {
        self.devices.get(pf).map_or(0, |d| d.ref_count)
    }

    /// Status of every PF, sorted by name
    pub fn status(&self) -> Vec<DeviceStatus> {
        let mut status: Vec<DeviceStatus> = self
            .devices
            .values()
            .map(|d| DeviceStatus {
                name: d.name.clone(),
                state: d.state(),
                ref_count: d.ref_count,
                total_vfs: d.handle.as_ref().map_or(0, |h| h.total_vfs()),
                free_vfs: d.handle.as_ref().map_or(0, |h| h.free_vfs()),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{Fault, SimulatedSriov};

    #[test]
    fn test_ensure_enabled_creates_entry() {
        let hw = SimulatedSriov::new().with_pf("eth10", 4);
        let mut registry = PfRegistry::new();

        let device = registry.ensure_enabled(&hw, "eth10").unwrap();
        assert_eq!(device.state(), State::Enabled);
        assert_eq!(device.ref_count(), 0);
        assert!(device.handle().is_some());
        assert!(hw.is_enabled("eth10"));
    }

    #[test]
    fn test_ensure_enabled_is_idempotent() {
        let hw = SimulatedSriov::new().with_pf("eth10", 4);
        let mut registry = PfRegistry::new();

        registry.ensure_enabled(&hw, "eth10").unwrap();
        registry.add_reference("eth10").unwrap();
        registry.ensure_enabled(&hw, "eth10").unwrap();

        assert_eq!(hw.enable_count("eth10"), 1);
        assert_eq!(registry.ref_count("eth10"), 1);
    }

    #[test]
    fn test_failed_enable_publishes_nothing() {
        let hw = SimulatedSriov::new().with_pf("eth10", 4);
        hw.inject("eth10", Fault::EnableSriov);
        let mut registry = PfRegistry::new();

        let err = registry.ensure_enabled(&hw, "eth10").err().unwrap();
        assert!(matches!(err, Error::HardwareInit { .. }));
        assert!(registry.get("eth10").is_none());
        assert!(registry.handle("eth10").is_err());
    }

    #[test]
    fn test_failed_configure_rolls_back() {
        let hw = SimulatedSriov::new().with_pf("eth10", 4);
        hw.inject("eth10", Fault::ConfigureVfs);
        let mut registry = PfRegistry::new();

        assert!(registry.ensure_enabled(&hw, "eth10").is_err());
        assert!(registry.status().is_empty());
        assert!(!hw.is_enabled("eth10"));
    }

    #[test]
    fn test_unknown_device_is_hardware_init_error() {
        let hw = SimulatedSriov::new();
        let mut registry = PfRegistry::new();

        assert!(matches!(
            registry.ensure_enabled(&hw, "eth99"),
            Err(Error::HardwareInit { .. })
        ));
    }

    #[test]
    fn test_release_to_zero_disables() {
        let hw = SimulatedSriov::new().with_pf("eth10", 4);
        let mut registry = PfRegistry::new();

        registry.ensure_enabled(&hw, "eth10").unwrap();
        registry.add_reference("eth10").unwrap();
        registry.add_reference("eth10").unwrap();

        assert!(!registry.release(&hw, "eth10").unwrap());
        assert_eq!(registry.ref_count("eth10"), 1);
        assert!(hw.is_enabled("eth10"));

        assert!(registry.release(&hw, "eth10").unwrap());
        assert!(registry.get("eth10").is_none());
        assert!(!hw.is_enabled("eth10"));
    }

    #[test]
    fn test_release_removes_entry_even_if_disable_fails() {
        let hw = SimulatedSriov::new().with_pf("eth10", 4);
        let mut registry = PfRegistry::new();

        registry.ensure_enabled(&hw, "eth10").unwrap();
        registry.add_reference("eth10").unwrap();
        hw.inject("eth10", Fault::DisableSriov);

        assert!(registry.release(&hw, "eth10").is_err());
        assert!(registry.get("eth10").is_none());
    }

    #[test]
    fn test_release_unknown_device() {
        let hw = SimulatedSriov::new();
        let mut registry = PfRegistry::new();
        assert!(!registry.release(&hw, "eth10").unwrap());
    }

    #[test]
    fn test_status_snapshot() {
        let hw = SimulatedSriov::new().with_pf("eth10", 4).with_pf("eth11", 2);
        let mut registry = PfRegistry::new();

        registry.ensure_enabled(&hw, "eth11").unwrap();
        registry.ensure_enabled(&hw, "eth10").unwrap();
        registry.add_reference("eth10").unwrap();
        registry.handle("eth10").unwrap().take_free().unwrap();

        let status = registry.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "eth10");
        assert_eq!(status[0].state, State::Enabled);
        assert_eq!(status[0].ref_count, 1);
        assert_eq!(status[0].total_vfs, 4);
        assert_eq!(status[0].free_vfs, 3);
        assert_eq!(status[1].name, "eth11");
        assert_eq!(status[1].ref_count, 0);
    }
}
