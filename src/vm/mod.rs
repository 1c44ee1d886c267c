// ============================================================================
// File: src/vm/mod.rs
// ----------------------------------------------------------------------------
// The VM handle owned by exactly one holder at a time, plus the
// serializable projection used on the remote-cache wire.
// ============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::VMConfig;
use crate::error::FactoryResult;
use crate::hypervisor::VmmHandles;

/// Diagnostic record for one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatus {
    /// VM identifier
    pub id: String,

    /// Current vCPU count
    pub cpus: u32,

    /// Current memory in MiB
    pub memory_mb: u32,
}

/// Serializable projection of a [`Vm`]
///
/// Carries everything a peer process needs to reconstruct a usable handle
/// over its own collaborator handles. The VM itself stays alive in the
/// hypervisor; only ownership of the handle moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSnapshotHandle {
    pub id: String,
    pub config: VMConfig,
    pub cpus: u32,
    pub memory_mb: u32,
    pub cpu_delta: u32,
}

/// Handle to a hypervisor-backed VM
///
/// Exclusively owned: a backend hands the handle out exactly once and never
/// keeps a copy. All operations delegate to the hypervisor-management layer.
#[derive(Debug)]
pub struct Vm {
    id: String,
    handles: VmmHandles,
    config: VMConfig,
    cpus: u32,
    memory_mb: u32,
    cpu_delta: u32,
}

impl Vm {
    /// Boot a new VM for `config` and connect its guest agent
    ///
    /// With `boot_from_template` set the VM restores from the referenced
    /// snapshot and comes up paused; otherwise it boots running.
    pub async fn new(handles: &VmmHandles, config: VMConfig) -> FactoryResult<Self> {
        config.valid()?;

        let id = Uuid::new_v4().to_string();
        handles.hypervisor.create_vm(&id, &config).await?;

        if let Err(e) = handles.agent.connect(&id).await {
            if let Err(stop_err) = handles.hypervisor.stop_vm(&id).await {
                log::warn!("failed to stop VM {id} after agent connect error: {stop_err}");
            }
            return Err(e);
        }

        let cpus = config.hypervisor_config.num_vcpus;
        let memory_mb = config.hypervisor_config.memory_size_mb;
        Ok(Self {
            id,
            handles: handles.clone(),
            config,
            cpus,
            memory_mb,
            cpu_delta: 0,
        })
    }

    /// Reconstruct a handle received over the remote-cache wire
    pub fn from_handle(handle: VmSnapshotHandle, handles: &VmmHandles) -> Self {
        Self {
            id: handle.id,
            handles: handles.clone(),
            config: handle.config,
            cpus: handle.cpus,
            memory_mb: handle.memory_mb,
            cpu_delta: handle.cpu_delta,
        }
    }

    /// Project this VM into its wire form
    pub fn to_handle(&self) -> VmSnapshotHandle {
        VmSnapshotHandle {
            id: self.id.clone(),
            config: self.config.clone(),
            cpus: self.cpus,
            memory_mb: self.memory_mb,
            cpu_delta: self.cpu_delta,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &VMConfig {
        &self.config
    }

    /// Effective vCPU count, including hot-added CPUs
    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    /// Effective memory in MiB, including hot-added memory
    pub fn memory_mb(&self) -> u32 {
        self.memory_mb
    }

    /// Diagnostic snapshot
    pub fn status(&self) -> VmStatus {
        VmStatus {
            id: self.id.clone(),
            cpus: self.cpus,
            memory_mb: self.memory_mb,
        }
    }

    /// Resume a paused VM
    pub async fn resume(&self) -> FactoryResult<()> {
        self.handles.hypervisor.resume_vm(&self.id).await
    }

    /// Pause a running VM
    pub async fn pause(&self) -> FactoryResult<()> {
        self.handles.hypervisor.pause_vm(&self.id).await
    }

    /// Stop the VM and release its resources
    pub async fn stop(&self) -> FactoryResult<()> {
        self.handles.hypervisor.stop_vm(&self.id).await
    }

    /// Persist memory and device state to the paths in the VM's config
    pub async fn save(&self) -> FactoryResult<()> {
        self.handles.hypervisor.save_vm(&self.id).await
    }

    /// Tear down the guest control channel without stopping the guest
    pub async fn disconnect(&self) -> FactoryResult<()> {
        self.handles.agent.disconnect(&self.id).await
    }

    /// Reseed the guest random-number generator
    pub async fn reseed_rng(&self) -> FactoryResult<()> {
        self.handles.agent.reseed_rng(&self.id).await
    }

    /// Re-synchronize the guest wall clock
    pub async fn sync_time(&self) -> FactoryResult<()> {
        self.handles.agent.sync_time(&self.id).await
    }

    /// Hot-add vCPUs; the delta is onlined later via [`Vm::online_cpu_mem`]
    pub async fn add_cpus(&mut self, count: u32) -> FactoryResult<()> {
        let added = self.handles.hypervisor.add_vcpus(&self.id, count).await?;
        self.cpus += added;
        self.cpu_delta += added;
        Ok(())
    }

    /// Hot-add memory in MiB
    pub async fn add_memory(&mut self, size_mb: u32) -> FactoryResult<()> {
        let added = self.handles.hypervisor.add_memory(&self.id, size_mb).await?;
        self.memory_mb += added;
        Ok(())
    }

    /// Make the guest online hot-added CPUs and memory
    pub async fn online_cpu_mem(&mut self) -> FactoryResult<()> {
        self.handles.agent.online_cpu_mem(&self.id).await?;
        self.cpu_delta = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HypervisorType, VMConfig};
    use crate::hypervisor::mock::{MockRunState, MockVmm};

    #[tokio::test]
    async fn boot_and_stop() {
        let vmm = MockVmm::new();
        let handles = vmm.handles();

        let vm = Vm::new(&handles, VMConfig::new(HypervisorType::Qemu, 1, 256))
            .await
            .expect("boot");
        assert_eq!(vm.cpus(), 1);
        assert_eq!(vm.memory_mb(), 256);
        assert_eq!(
            vmm.state(vm.id()).expect("state").run_state,
            MockRunState::Running
        );

        vm.stop().await.expect("stop");
        assert_eq!(
            vmm.state(vm.id()).expect("state").run_state,
            MockRunState::Stopped
        );
    }

    #[tokio::test]
    async fn hotplug_updates_effective_sizing() {
        let vmm = MockVmm::new();
        let handles = vmm.handles();

        let mut vm = Vm::new(&handles, VMConfig::new(HypervisorType::Qemu, 1, 256))
            .await
            .expect("boot");
        vm.add_cpus(2).await.expect("add cpus");
        vm.add_memory(512).await.expect("add memory");
        vm.online_cpu_mem().await.expect("online");

        assert_eq!(vm.cpus(), 3);
        assert_eq!(vm.memory_mb(), 768);

        let state = vmm.state(vm.id()).expect("state");
        assert_eq!(state.cpus, 3);
        assert_eq!(state.memory_mb, 768);
    }

    #[tokio::test]
    async fn handle_round_trip_preserves_identity() {
        let vmm = MockVmm::new();
        let handles = vmm.handles();

        let vm = Vm::new(&handles, VMConfig::new(HypervisorType::Qemu, 2, 512))
            .await
            .expect("boot");
        let wire = vm.to_handle();
        let rebuilt = Vm::from_handle(wire, &handles);

        assert_eq!(rebuilt.id(), vm.id());
        assert_eq!(rebuilt.cpus(), 2);
        assert_eq!(rebuilt.memory_mb(), 512);
        // both handles drive the same underlying VM
        rebuilt.pause().await.expect("pause via rebuilt handle");
        assert_eq!(
            vmm.state(vm.id()).expect("state").run_state,
            MockRunState::Paused
        );
    }

    #[tokio::test]
    async fn invalid_config_boots_nothing() {
        let vmm = MockVmm::new();
        let handles = vmm.handles();

        let result = Vm::new(&handles, VMConfig::new(HypervisorType::Qemu, 0, 256)).await;
        assert!(result.is_err());
        assert_eq!(vmm.created_count(), 0);
    }
}
