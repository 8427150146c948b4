//! Linux SR-IOV backend
//!
//! Drives PFs through sysfs (`sriov_numvfs`, `virtfnN` links, driver
//! bind/unbind) and configures VFs with `ip link set <pf> vf <n> ...`.

use crate::error::{Error, Result};
use crate::hw::{MacAddress, PfHandle, SriovControl, VfHandle};
use crate::manifest::DiscoveryConfig;
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Summary of an SR-IOV capable PF found in sysfs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfInfo {
    pub name: String,
    pub total_vfs: u32,
    pub num_vfs: u32,
}

/// Create backoff strategy from DiscoveryConfig
fn backoff_from_config(config: &DiscoveryConfig) -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(config.base_delay_ms)
        .max_delay_ms(config.max_delay_ms)
        .multiplier(config.multiplier)
        .max_attempts(config.max_attempts)
        .jitter_factor(config.jitter_factor)
}

/// sysfs + iproute2 implementation of `SriovControl`
#[derive(Debug, Clone)]
pub struct SysfsSriov {
    /// sysfs mount point (normally "/sys")
    root: PathBuf,
    /// iproute2 binary
    ip_command: String,
    /// Retry settings for VF discovery
    discovery: DiscoveryConfig,
}

impl SysfsSriov {
    pub fn new(root: impl Into<PathBuf>, ip_command: impl Into<String>, discovery: DiscoveryConfig) -> Self {
        Self {
            root: root.into(),
            ip_command: ip_command.into(),
            discovery,
        }
    }

    /// PCI device directory behind a netdev
    fn device_dir(&self, pf: &str) -> PathBuf {
        self.root.join("class/net").join(pf).join("device")
    }

    /// Maximum number of VFs the PF supports
    pub fn total_vfs(&self, pf: &str) -> Result<u32> {
        let path = self.device_dir(pf).join("sriov_totalvfs");
        if !path.exists() {
            return Err(Error::SriovUnsupported(pf.to_string()));
        }
        read_u32(&path)
    }

    /// Number of VFs currently enabled
    pub fn num_vfs(&self, pf: &str) -> Result<u32> {
        read_u32(&self.device_dir(pf).join("sriov_numvfs"))
    }

    fn set_num_vfs(&self, pf: &str, count: u32) -> Result<()> {
        let path = self.device_dir(pf).join("sriov_numvfs");
        debug!(pf = %pf, count, "Writing sriov_numvfs");
        fs::write(&path, count.to_string()).map_err(|e| {
            Error::Sriov(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    /// List every netdev whose device supports SR-IOV
    pub fn list_capable(&self) -> Result<Vec<PfInfo>> {
        let net_dir = self.root.join("class/net");
        let mut pfs = Vec::new();

        for entry in fs::read_dir(&net_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            let total_vfs = match self.total_vfs(&name) {
                Ok(n) if n > 0 => n,
                _ => continue,
            };
            let num_vfs = self.num_vfs(&name).unwrap_or(0);

            pfs.push(PfInfo {
                name,
                total_vfs,
                num_vfs,
            });
        }

        pfs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pfs)
    }

    /// Single pass over the `virtfnN` entries of a PF
    ///
    /// VFs whose netdev has not appeared yet are left out.
    fn scan_vfs(&self, pf: &str) -> Result<Vec<VfHandle>> {
        let mut vfs = Vec::new();

        for entry in fs::read_dir(self.device_dir(pf))? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(index) = file_name
                .strip_prefix("virtfn")
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let vf_dir = entry.path();
            let Some(netdev) = first_entry_name(&vf_dir.join("net")) else {
                continue;
            };

            let mac = fs::read_to_string(vf_dir.join("net").join(&netdev).join("address"))
                .ok()
                .and_then(|s| s.parse::<MacAddress>().ok())
                .filter(|m| !m.is_zero());

            let pci_address = fs::read_link(&vf_dir)
                .ok()
                .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()));

            vfs.push(VfHandle {
                index,
                netdev,
                mac,
                pci_address,
            });
        }

        vfs.sort_by_key(|vf| vf.index);
        Ok(vfs)
    }

    /// Run `ip link set ...`
    fn ip_link(&self, args: &[&str]) -> Result<()> {
        let command = format!("{} link set {}", self.ip_command, args.join(" "));
        debug!(command = %command, "Running");

        let output = Command::new(&self.ip_command)
            .args(["link", "set"])
            .args(args)
            .output()
            .map_err(|e| Error::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CommandFailed {
                command,
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    /// Unbind and rebind a VF to its driver so a new MAC takes effect
    fn rebind_vf(&self, pci_address: &str) -> Result<()> {
        let device = self.root.join("bus/pci/devices").join(pci_address);
        let Some(driver) = fs::read_link(device.join("driver"))
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
        else {
            debug!(address = %pci_address, "VF has no driver bound, skipping rebind");
            return Ok(());
        };

        let driver_dir = self.root.join("bus/pci/drivers").join(&driver);
        debug!(address = %pci_address, driver = %driver, "Rebinding VF");

        fs::write(driver_dir.join("unbind"), pci_address).map_err(|e| {
            Error::Sriov(format!("Failed to unbind {} from {}: {}", pci_address, driver, e))
        })?;
        fs::write(driver_dir.join("bind"), pci_address).map_err(|e| {
            Error::Sriov(format!("Failed to bind {} to {}: {}", pci_address, driver, e))
        })?;

        Ok(())
    }
}

impl SriovControl for SysfsSriov {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn enable_sriov(&self, pf: &str) -> Result<()> {
        let total = self.total_vfs(pf)?;
        if total == 0 {
            return Err(Error::SriovUnsupported(pf.to_string()));
        }

        let current = self.num_vfs(pf)?;
        if current == total {
            debug!(pf = %pf, vfs = total, "SR-IOV already enabled");
            return Ok(());
        }

        // The kernel refuses to change a non-zero VF count directly
        if current != 0 {
            self.set_num_vfs(pf, 0)?;
        }
        self.set_num_vfs(pf, total)?;

        info!(pf = %pf, vfs = total, "SR-IOV enabled");
        Ok(())
    }

    fn disable_sriov(&self, pf: &str) -> Result<()> {
        self.set_num_vfs(pf, 0)?;
        info!(pf = %pf, "SR-IOV disabled");
        Ok(())
    }

    fn pf_handle(&self, pf: &str) -> Result<PfHandle> {
        let expected = self.num_vfs(pf)? as usize;
        let backoff = backoff_from_config(&self.discovery);
        let mut rng = rng();
        let mut attempt: u8 = 0;

        loop {
            attempt += 1;
            let pending = match self.scan_vfs(pf) {
                Ok(vfs) if vfs.len() >= expected => {
                    debug!(pf = %pf, vfs = vfs.len(), attempt, "VFs discovered");
                    return Ok(PfHandle::new(pf, vfs));
                }
                Ok(vfs) => format!("{} of {} VF netdevs present", vfs.len(), expected),
                Err(e) => e.to_string(),
            };

            match backoff.delay(attempt, &mut rng) {
                Some(delay_ms) => {
                    debug!(pf = %pf, attempt, delay_ms, reason = %pending, "Waiting for VFs");
                    thread::sleep(Duration::from_millis(delay_ms));
                }
                None => {
                    return Err(Error::Sriov(format!(
                        "VFs of {} not ready after {} attempts: {}",
                        pf, attempt, pending
                    )));
                }
            }
        }
    }

    fn configure_vfs(&self, handle: &mut PfHandle) -> Result<()> {
        let pf = handle.name().to_string();
        self.ip_link(&[pf.as_str(), "up"])?;

        for vf in handle.vfs_mut() {
            if vf.mac.is_some() {
                continue;
            }

            let mac = MacAddress::random_local();
            let index = vf.index.to_string();
            let mac_str = mac.to_string();
            self.ip_link(&[pf.as_str(), "vf", index.as_str(), "mac", mac_str.as_str()])?;

            if let Some(pci) = &vf.pci_address {
                self.rebind_vf(pci)?;
                // The netdev may come back under a new name
                let net_dir = self.device_dir(&pf).join(format!("virtfn{}", vf.index)).join("net");
                match first_entry_name(&net_dir) {
                    Some(netdev) => vf.netdev = netdev,
                    None => warn!(pf = %pf, vf = vf.index, "VF netdev missing after rebind"),
                }
            }

            debug!(pf = %pf, vf = vf.index, mac = %mac, "Assigned VF MAC");
            vf.mac = Some(mac);
        }

        Ok(())
    }

    fn set_vf_vlan(&self, handle: &PfHandle, vf: &VfHandle, vlan: u16) -> Result<()> {
        let index = vf.index.to_string();
        let vlan = vlan.to_string();
        self.ip_link(&[handle.name(), "vf", index.as_str(), "vlan", vlan.as_str()])
    }

    fn set_vf_privileged(&self, handle: &PfHandle, vf: &VfHandle, privileged: bool) -> Result<()> {
        let index = vf.index.to_string();
        let (trust, spoofchk) = if privileged { ("on", "off") } else { ("off", "on") };
        self.ip_link(&[handle.name(), "vf", index.as_str(), "trust", trust])?;
        self.ip_link(&[handle.name(), "vf", index.as_str(), "spoofchk", spoofchk])
    }
}

/// Read a decimal integer from a sysfs attribute
fn read_u32(path: &Path) -> Result<u32> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Sriov(format!("Failed to read {}: {}", path.display(), e)))?;
    content
        .trim()
        .parse()
        .map_err(|_| Error::Sriov(format!("Unexpected content in {}: {:?}", path.display(), content.trim())))
}

/// Name of the first entry in a directory, if any
fn first_entry_name(dir: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names.into_iter().next()
}
