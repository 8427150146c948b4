//! Hardware control for SR-IOV physical functions
//!
//! Provides:
//! - The `SriovControl` trait consumed by the driver core
//! - PF handles owning the pool of virtual functions
//! - A sysfs/iproute2 backend for real hardware
//! - A simulated backend for tests and hardware-less hosts

pub mod mac;
pub mod sim;
pub mod sysfs;

pub use mac::MacAddress;
pub use sim::SimulatedSriov;
pub use sysfs::SysfsSriov;

use crate::error::{Error, Result};
use std::sync::{Mutex, PoisonError};

/// A virtual function carved out of a PF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfHandle {
    /// VF index on the PF (the N in virtfnN)
    pub index: u32,
    /// Netdev name of the VF on the host (e.g., "ens1f0v3")
    pub netdev: String,
    /// Hardware MAC address, if one has been assigned
    pub mac: Option<MacAddress>,
    /// PCI address of the VF (e.g., "0000:03:00.5")
    pub pci_address: Option<String>,
}

#[derive(Debug)]
struct VfSlot {
    vf: VfHandle,
    allocated: bool,
}

/// Handle to a PF with SR-IOV enabled
///
/// Owns the VF pool. Allocation and release go through the pool lock, so a
/// VF is never handed to two consumers at once.
#[derive(Debug)]
pub struct PfHandle {
    name: String,
    pool: Mutex<Vec<VfSlot>>,
}

impl PfHandle {
    /// Create a handle over the given VFs, all free
    pub fn new(name: impl Into<String>, vfs: Vec<VfHandle>) -> Self {
        let slots = vfs
            .into_iter()
            .map(|vf| VfSlot {
                vf,
                allocated: false,
            })
            .collect();
        Self {
            name: name.into(),
            pool: Mutex::new(slots),
        }
    }

    /// PF netdev name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of VFs in the pool
    pub fn total_vfs(&self) -> usize {
        self.slots().len()
    }

    /// Number of VFs not bound to any endpoint
    pub fn free_vfs(&self) -> usize {
        self.slots().iter().filter(|s| !s.allocated).count()
    }

    /// Snapshot of every VF in the pool
    pub fn vfs(&self) -> Vec<VfHandle> {
        self.slots().iter().map(|s| s.vf.clone()).collect()
    }

    /// Check whether the VF with this index is currently allocated
    pub fn is_allocated(&self, index: u32) -> bool {
        self.slots()
            .iter()
            .any(|s| s.vf.index == index && s.allocated)
    }

    /// Mutable access to the VFs while the handle is still exclusively owned
    pub fn vfs_mut(&mut self) -> impl Iterator<Item = &mut VfHandle> {
        self.pool
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .map(|s| &mut s.vf)
    }

    /// Take the first free VF
    pub fn take_free(&self) -> Result<VfHandle> {
        let mut slots = self.slots();
        let slot = slots
            .iter_mut()
            .find(|s| !s.allocated)
            .ok_or_else(|| Error::VfAllocation {
                device: self.name.clone(),
                message: "no free VF left in pool".to_string(),
            })?;
        slot.allocated = true;
        Ok(slot.vf.clone())
    }

    /// Take the free VF whose hardware MAC matches `mac`
    pub fn take_by_mac(&self, mac: &MacAddress) -> Result<VfHandle> {
        let mut slots = self.slots();
        let slot = slots
            .iter_mut()
            .find(|s| s.vf.mac.as_ref() == Some(mac))
            .ok_or_else(|| Error::VfAllocation {
                device: self.name.clone(),
                message: format!("no VF with MAC {}", mac),
            })?;
        if slot.allocated {
            return Err(Error::VfAllocation {
                device: self.name.clone(),
                message: format!("VF with MAC {} is already in use", mac),
            });
        }
        slot.allocated = true;
        Ok(slot.vf.clone())
    }

    /// Return a VF to the free pool
    pub fn put_back(&self, vf: &VfHandle) -> Result<()> {
        let mut slots = self.slots();
        let slot = slots
            .iter_mut()
            .find(|s| s.vf.index == vf.index)
            .ok_or_else(|| Error::Sriov(format!("VF {} does not belong to {}", vf.index, self.name)))?;
        slot.allocated = false;
        Ok(())
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Vec<VfSlot>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Kernel-level SR-IOV control primitives
///
/// Implementations must be callable from several threads at once; every
/// call is synchronous and may block on the kernel.
pub trait SriovControl: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Enable SR-IOV on a PF, creating its VFs
    fn enable_sriov(&self, pf: &str) -> Result<()>;

    /// Disable SR-IOV on a PF, destroying its VFs
    fn disable_sriov(&self, pf: &str) -> Result<()>;

    /// Enumerate the VFs of an enabled PF
    fn pf_handle(&self, pf: &str) -> Result<PfHandle>;

    /// Prepare the VF pool for use (link up, MAC assignment)
    fn configure_vfs(&self, handle: &mut PfHandle) -> Result<()>;

    /// Tag a VF with a VLAN id
    fn set_vf_vlan(&self, handle: &PfHandle, vf: &VfHandle, vlan: u16) -> Result<()>;

    /// Toggle trust/spoof-check on a VF
    fn set_vf_privileged(&self, handle: &PfHandle, vf: &VfHandle, privileged: bool) -> Result<()>;

    /// Allocate any free VF
    fn allocate_vf(&self, handle: &PfHandle) -> Result<VfHandle> {
        handle.take_free()
    }

    /// Allocate the VF owning the given MAC
    fn allocate_vf_by_mac(&self, handle: &PfHandle, mac: &MacAddress) -> Result<VfHandle> {
        handle.take_by_mac(mac)
    }

    /// Return a VF to the pool
    fn free_vf(&self, handle: &PfHandle, vf: &VfHandle) -> Result<()> {
        handle.put_back(vf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vf(index: u32, mac: &str) -> VfHandle {
        VfHandle {
            index,
            netdev: format!("eth10v{}", index),
            mac: Some(mac.parse().unwrap()),
            pci_address: None,
        }
    }

    fn handle() -> PfHandle {
        PfHandle::new(
            "eth10",
            vec![vf(0, "02:00:00:00:00:10"), vf(1, "02:00:00:00:00:11")],
        )
    }

    #[test]
    fn test_take_free_exhausts_pool() {
        let handle = handle();
        assert_eq!(handle.take_free().unwrap().index, 0);
        assert_eq!(handle.take_free().unwrap().index, 1);
        assert!(matches!(handle.take_free(), Err(Error::VfAllocation { .. })));
        assert_eq!(handle.free_vfs(), 0);
    }

    #[test]
    fn test_take_by_mac() {
        let handle = handle();
        let mac: MacAddress = "02:00:00:00:00:11".parse().unwrap();

        let vf = handle.take_by_mac(&mac).unwrap();
        assert_eq!(vf.index, 1);
        assert!(handle.is_allocated(1));

        // Already bound
        assert!(handle.take_by_mac(&mac).is_err());

        // Unknown MAC
        let other: MacAddress = "02:00:00:00:00:99".parse().unwrap();
        assert!(handle.take_by_mac(&other).is_err());
    }

    #[test]
    fn test_put_back() {
        let handle = handle();
        let vf = handle.take_free().unwrap();
        assert_eq!(handle.free_vfs(), 1);

        handle.put_back(&vf).unwrap();
        assert_eq!(handle.free_vfs(), 2);
        assert!(!handle.is_allocated(vf.index));
    }

    #[test]
    fn test_put_back_foreign_vf() {
        let handle = handle();
        assert!(handle.put_back(&vf(7, "02:00:00:00:00:17")).is_err());
    }
}
