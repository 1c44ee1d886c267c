// ============================================================================
// File: src/hypervisor/mod.rs
// ----------------------------------------------------------------------------
// Collaborator traits for the hypervisor-management layer and the guest
// agent. The factory treats both as black boxes: it never looks inside a
// VM, it only drives these operations against it.
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::VMConfig;
use crate::error::FactoryResult;

pub mod mock;

/// Hypervisor-management operations the factory consumes
///
/// One implementation serves every VM; operations are keyed by VM id.
#[async_trait]
pub trait Hypervisor: Send + Sync + fmt::Debug {
    /// Boot a new VM for `config` under the given id
    ///
    /// A config with `boot_from_template` set restores from the referenced
    /// snapshot files and leaves the VM paused; otherwise the VM boots
    /// running.
    async fn create_vm(&self, id: &str, config: &VMConfig) -> FactoryResult<()>;

    /// Resume a paused VM
    async fn resume_vm(&self, id: &str) -> FactoryResult<()>;

    /// Pause a running VM
    async fn pause_vm(&self, id: &str) -> FactoryResult<()>;

    /// Stop a VM and release its resources
    async fn stop_vm(&self, id: &str) -> FactoryResult<()>;

    /// Persist a paused VM's memory and device state to the paths in its
    /// config
    async fn save_vm(&self, id: &str) -> FactoryResult<()>;

    /// Hot-add vCPUs; returns the count actually added
    async fn add_vcpus(&self, id: &str, count: u32) -> FactoryResult<u32>;

    /// Hot-add memory in MiB; returns the amount actually added
    async fn add_memory(&self, id: &str, size_mb: u32) -> FactoryResult<u32>;
}

/// Guest agent operations the factory consumes
#[async_trait]
pub trait GuestAgent: Send + Sync + fmt::Debug {
    /// Establish the control channel to the guest
    async fn connect(&self, id: &str) -> FactoryResult<()>;

    /// Probe whether the control channel answers
    async fn check(&self, id: &str) -> FactoryResult<()>;

    /// Tear down the control channel without stopping the guest
    async fn disconnect(&self, id: &str) -> FactoryResult<()>;

    /// Reseed the guest random-number generator
    async fn reseed_rng(&self, id: &str) -> FactoryResult<()>;

    /// Re-synchronize the guest wall clock with the host
    async fn sync_time(&self, id: &str) -> FactoryResult<()>;

    /// Make the guest online any hot-added CPUs and memory
    async fn online_cpu_mem(&self, id: &str) -> FactoryResult<()>;
}

/// Shared handles to the hypervisor-management layer
///
/// Cloned freely; every component in the backend chain drives VMs through
/// the same pair.
#[derive(Debug, Clone)]
pub struct VmmHandles {
    /// Hypervisor-management handle
    pub hypervisor: Arc<dyn Hypervisor>,

    /// Guest agent handle
    pub agent: Arc<dyn GuestAgent>,
}

impl VmmHandles {
    /// Bundle a hypervisor and agent pair
    pub fn new(hypervisor: Arc<dyn Hypervisor>, agent: Arc<dyn GuestAgent>) -> Self {
        Self { hypervisor, agent }
    }
}
