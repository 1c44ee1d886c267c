// ============================================================================
// File: src/config/mod.rs
// ----------------------------------------------------------------------------
// VM configuration types, static validation and the volatile-field
// compatibility check that decides between the accelerated path and the
// direct fallback.
// ============================================================================

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FactoryError, FactoryResult};

/// Hypervisor flavor backing a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HypervisorType {
    /// QEMU/KVM, the only hypervisor with template (snapshot/restore) support
    #[default]
    #[serde(rename = "qemu")]
    Qemu,

    /// Firecracker microVM
    #[serde(rename = "firecracker")]
    Firecracker,

    /// Cloud Hypervisor
    #[serde(rename = "clh")]
    CloudHypervisor,
}

impl std::fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HypervisorType::Qemu => write!(f, "qemu"),
            HypervisorType::Firecracker => write!(f, "firecracker"),
            HypervisorType::CloudHypervisor => write!(f, "clh"),
        }
    }
}

/// Volatile `HypervisorConfig` fields, ignored by the compatibility check
///
/// Two configs that differ only in these fields still share a base image:
/// sizing is reconciled by hotplug and the template/storage paths are
/// per-invocation by nature. Keep this list in sync with
/// [`HypervisorConfig::scrubbed`].
pub const VOLATILE_FIELDS: &[&str] = &[
    "num_vcpus",
    "memory_size_mb",
    "boot_to_template",
    "boot_from_template",
    "memory_path",
    "devices_state_path",
    "vm_store_path",
    "run_store_path",
];

/// Hypervisor configuration for a single VM
///
/// Identity fields (paths, machine type, drivers) pin down which base image
/// a VM boots from; volatile fields carry per-invocation sizing and
/// template/storage state and never participate in compatibility decisions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// Guest kernel host path
    pub kernel_path: PathBuf,

    /// Guest rootfs image host path
    pub image_path: PathBuf,

    /// Guest initrd host path; mutually exclusive with `image_path`
    pub initrd_path: PathBuf,

    /// Guest firmware host path
    pub firmware_path: PathBuf,

    /// Additional guest kernel parameters
    pub kernel_params: String,

    /// Hypervisor binary host path
    pub hypervisor_path: PathBuf,

    /// Machine type the hypervisor emulates
    pub machine_type: String,

    /// Upper bound for vCPU hotplug
    pub default_max_vcpus: u32,

    /// Host entropy source fed to the guest
    pub entropy_source: PathBuf,

    /// Block device driver exposed to the guest
    pub block_device_driver: String,

    /// Number of vCPUs the VM boots with (volatile)
    pub num_vcpus: u32,

    /// Guest memory in MiB (volatile)
    pub memory_size_mb: u32,

    /// Boot this VM to become a template (volatile)
    pub boot_to_template: bool,

    /// Boot this VM from an existing template (volatile)
    pub boot_from_template: bool,

    /// Memory snapshot file path, required by either template flag (volatile)
    pub memory_path: PathBuf,

    /// Device state file path, required when booting from a template (volatile)
    pub devices_state_path: PathBuf,

    /// Per-invocation VM storage path (volatile)
    pub vm_store_path: PathBuf,

    /// Per-invocation runtime storage path (volatile)
    pub run_store_path: PathBuf,
}

impl HypervisorConfig {
    /// Statically validate the configuration
    ///
    /// # Returns
    /// `Ok(())` when the config can boot a VM, an `InvalidConfig` error
    /// naming the offending field otherwise.
    pub fn valid(&self) -> FactoryResult<()> {
        if self.kernel_path.as_os_str().is_empty() {
            return Err(FactoryError::invalid_config("missing kernel path"));
        }

        if !self.image_path.as_os_str().is_empty() && !self.initrd_path.as_os_str().is_empty() {
            return Err(FactoryError::invalid_config(
                "image and initrd paths cannot both be set",
            ));
        }

        if self.num_vcpus == 0 {
            return Err(FactoryError::invalid_config("vCPU count must be non-zero"));
        }

        if self.memory_size_mb == 0 {
            return Err(FactoryError::invalid_config("memory size must be non-zero"));
        }

        if self.boot_to_template && self.boot_from_template {
            return Err(FactoryError::invalid_config(
                "cannot boot to and from a template at the same time",
            ));
        }

        if (self.boot_to_template || self.boot_from_template)
            && self.memory_path.as_os_str().is_empty()
        {
            return Err(FactoryError::invalid_config(
                "missing memory path for VM template",
            ));
        }

        if self.boot_from_template && self.devices_state_path.as_os_str().is_empty() {
            return Err(FactoryError::invalid_config(
                "missing device state path to load from VM template",
            ));
        }

        Ok(())
    }

    /// Return a copy with every field in [`VOLATILE_FIELDS`] reset
    pub(crate) fn scrubbed(&self) -> Self {
        let mut scrubbed = self.clone();
        scrubbed.num_vcpus = 0;
        scrubbed.memory_size_mb = 0;
        scrubbed.boot_to_template = false;
        scrubbed.boot_from_template = false;
        scrubbed.memory_path = PathBuf::new();
        scrubbed.devices_state_path = PathBuf::new();
        scrubbed.vm_store_path = PathBuf::new();
        scrubbed.run_store_path = PathBuf::new();
        scrubbed
    }
}

/// Complete configuration for one VM
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VMConfig {
    /// Hypervisor flavor
    pub hypervisor_type: HypervisorType,

    /// Hypervisor settings
    pub hypervisor_config: HypervisorConfig,
}

impl VMConfig {
    /// Create a config with the given sizing over default identity fields
    pub fn new(hypervisor_type: HypervisorType, num_vcpus: u32, memory_size_mb: u32) -> Self {
        Self {
            hypervisor_type,
            hypervisor_config: HypervisorConfig {
                kernel_path: PathBuf::from("/usr/share/vm/vmlinuz"),
                num_vcpus,
                memory_size_mb,
                ..Default::default()
            },
        }
    }

    /// Statically validate the configuration
    pub fn valid(&self) -> FactoryResult<()> {
        self.hypervisor_config.valid()
    }

    /// Check whether `requested` can be served from a base VM built for `self`
    ///
    /// Compatible iff the hypervisor types match and the hypervisor configs
    /// are deep-equal after scrubbing the volatile fields. An incompatible
    /// pair is not an error; the factory falls back to direct creation.
    pub fn compatible(&self, requested: &VMConfig) -> bool {
        if self.hypervisor_type != requested.hypervisor_type {
            log::debug!(
                "config incompatible: hypervisor type {} != {}",
                self.hypervisor_type,
                requested.hypervisor_type
            );
            return false;
        }

        let base = self.hypervisor_config.scrubbed();
        let wanted = requested.hypervisor_config.scrubbed();
        if base != wanted {
            log::debug!("config incompatible: identity fields differ");
            return false;
        }

        true
    }
}
