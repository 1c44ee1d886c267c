// ============================================================================
// File: src/hypervisor/mock.rs
// ----------------------------------------------------------------------------
// In-memory mock hypervisor/agent pair. Records per-VM run state and sizing
// so factory behavior can be asserted without KVM; also backs the remote
// cache server in environments without a real hypervisor.
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::VMConfig;
use crate::error::{FactoryError, FactoryResult};

use super::{GuestAgent, Hypervisor, VmmHandles};

/// Run state of a mock VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockRunState {
    Running,
    Paused,
    Stopped,
}

/// Observable state of one mock VM
#[derive(Debug, Clone)]
pub struct MockVmState {
    pub config: VMConfig,
    pub run_state: MockRunState,
    pub agent_connected: bool,
    pub cpus: u32,
    pub memory_mb: u32,
}

/// Mock implementation of both collaborator traits
///
/// Clone the same `Arc<MockVmm>` into the hypervisor and agent slots of
/// [`VmmHandles`]; the pair then shares one VM table.
#[derive(Debug, Default)]
pub struct MockVmm {
    vms: Mutex<HashMap<String, MockVmState>>,
    created: AtomicUsize,
    fail_ops: Mutex<HashSet<&'static str>>,
    hang_ops: Mutex<HashSet<&'static str>>,
}

impl MockVmm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build [`VmmHandles`] backed by this mock
    pub fn handles(self: &Arc<Self>) -> VmmHandles {
        VmmHandles::new(self.clone(), self.clone())
    }

    /// Force every future invocation of `op` to fail
    pub fn fail_op(&self, op: &'static str) {
        self.lock_fail_ops().insert(op);
    }

    /// Stop failing `op`
    pub fn clear_fail(&self, op: &'static str) {
        self.lock_fail_ops().remove(op);
    }

    /// Make every invocation of the hypervisor op `op` park until released
    pub fn hang_op(&self, op: &'static str) {
        self.lock_hang_ops().insert(op);
    }

    /// Release a hung `op`
    pub fn clear_hang(&self, op: &'static str) {
        self.lock_hang_ops().remove(op);
    }

    /// Number of VMs ever created
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of VMs not yet stopped
    pub fn live_count(&self) -> usize {
        self.lock_vms()
            .values()
            .filter(|s| s.run_state != MockRunState::Stopped)
            .count()
    }

    /// Snapshot the state of one VM
    pub fn state(&self, id: &str) -> Option<MockVmState> {
        self.lock_vms().get(id).cloned()
    }

    fn lock_vms(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockVmState>> {
        self.vms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_fail_ops(&self) -> std::sync::MutexGuard<'_, HashSet<&'static str>> {
        self.fail_ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_hang_ops(&self) -> std::sync::MutexGuard<'_, HashSet<&'static str>> {
        self.hang_ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn gate(&self, op: &'static str) {
        while self.lock_hang_ops().contains(op) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn check_fail(&self, op: &'static str, id: &str) -> FactoryResult<()> {
        if self.lock_fail_ops().contains(op) {
            return Err(FactoryError::hypervisor(op, id, "injected failure"));
        }
        Ok(())
    }

    fn with_vm<T>(
        &self,
        op: &'static str,
        id: &str,
        f: impl FnOnce(&mut MockVmState) -> FactoryResult<T>,
    ) -> FactoryResult<T> {
        self.check_fail(op, id)?;
        let mut vms = self.lock_vms();
        let state = vms
            .get_mut(id)
            .ok_or_else(|| FactoryError::hypervisor(op, id, "unknown VM"))?;
        f(state)
    }
}

#[async_trait]
impl Hypervisor for MockVmm {
    async fn create_vm(&self, id: &str, config: &VMConfig) -> FactoryResult<()> {
        self.gate("create_vm").await;
        self.check_fail("create_vm", id)?;

        let hc = &config.hypervisor_config;
        let run_state = if hc.boot_from_template {
            // A restore needs both snapshot files on disk and comes up paused.
            for (path, file) in [(&hc.memory_path, "memory"), (&hc.devices_state_path, "state")] {
                if !path.is_file() {
                    return Err(FactoryError::hypervisor(
                        "create_vm",
                        id,
                        format!("template {file} file {} not found", path.display()),
                    ));
                }
            }
            MockRunState::Paused
        } else {
            MockRunState::Running
        };

        let mut vms = self.lock_vms();
        if vms.contains_key(id) {
            return Err(FactoryError::hypervisor("create_vm", id, "duplicate VM id"));
        }
        vms.insert(
            id.to_string(),
            MockVmState {
                config: config.clone(),
                run_state,
                agent_connected: false,
                cpus: hc.num_vcpus,
                memory_mb: hc.memory_size_mb,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume_vm(&self, id: &str) -> FactoryResult<()> {
        self.gate("resume_vm").await;
        self.with_vm("resume_vm", id, |state| match state.run_state {
            MockRunState::Paused => {
                state.run_state = MockRunState::Running;
                Ok(())
            }
            MockRunState::Running => Ok(()),
            MockRunState::Stopped => Err(FactoryError::hypervisor(
                "resume_vm",
                id,
                "VM already stopped",
            )),
        })
    }

    async fn pause_vm(&self, id: &str) -> FactoryResult<()> {
        self.gate("pause_vm").await;
        self.with_vm("pause_vm", id, |state| match state.run_state {
            MockRunState::Running | MockRunState::Paused => {
                state.run_state = MockRunState::Paused;
                Ok(())
            }
            MockRunState::Stopped => Err(FactoryError::hypervisor(
                "pause_vm",
                id,
                "VM already stopped",
            )),
        })
    }

    async fn stop_vm(&self, id: &str) -> FactoryResult<()> {
        self.gate("stop_vm").await;
        self.with_vm("stop_vm", id, |state| {
            state.run_state = MockRunState::Stopped;
            state.agent_connected = false;
            Ok(())
        })
    }

    async fn save_vm(&self, id: &str) -> FactoryResult<()> {
        self.gate("save_vm").await;
        self.with_vm("save_vm", id, |state| {
            if state.run_state != MockRunState::Paused {
                return Err(FactoryError::hypervisor(
                    "save_vm",
                    id,
                    "VM must be paused before saving",
                ));
            }
            let hc = &state.config.hypervisor_config;
            fs::write(&hc.memory_path, b"mock-memory-snapshot")
                .map_err(|e| FactoryError::storage(e.to_string()))?;
            fs::write(&hc.devices_state_path, b"mock-device-state")
                .map_err(|e| FactoryError::storage(e.to_string()))?;
            Ok(())
        })
    }

    async fn add_vcpus(&self, id: &str, count: u32) -> FactoryResult<u32> {
        self.with_vm("add_vcpus", id, |state| {
            state.cpus += count;
            Ok(count)
        })
    }

    async fn add_memory(&self, id: &str, size_mb: u32) -> FactoryResult<u32> {
        self.with_vm("add_memory", id, |state| {
            state.memory_mb += size_mb;
            Ok(size_mb)
        })
    }
}

#[async_trait]
impl GuestAgent for MockVmm {
    async fn connect(&self, id: &str) -> FactoryResult<()> {
        self.with_vm("connect", id, |state| {
            if state.run_state == MockRunState::Stopped {
                return Err(FactoryError::agent("connect", id, "VM already stopped"));
            }
            state.agent_connected = true;
            Ok(())
        })
    }

    async fn check(&self, id: &str) -> FactoryResult<()> {
        self.with_vm("check", id, |state| {
            if !state.agent_connected {
                return Err(FactoryError::agent("check", id, "agent not connected"));
            }
            Ok(())
        })
    }

    async fn disconnect(&self, id: &str) -> FactoryResult<()> {
        self.with_vm("disconnect", id, |state| {
            state.agent_connected = false;
            Ok(())
        })
    }

    async fn reseed_rng(&self, id: &str) -> FactoryResult<()> {
        self.with_vm("reseed_rng", id, |state| {
            if state.run_state != MockRunState::Running {
                return Err(FactoryError::agent("reseed_rng", id, "VM not running"));
            }
            Ok(())
        })
    }

    async fn sync_time(&self, id: &str) -> FactoryResult<()> {
        self.with_vm("sync_time", id, |state| {
            if state.run_state != MockRunState::Running {
                return Err(FactoryError::agent("sync_time", id, "VM not running"));
            }
            Ok(())
        })
    }

    async fn online_cpu_mem(&self, id: &str) -> FactoryResult<()> {
        self.with_vm("online_cpu_mem", id, |state| {
            if state.run_state != MockRunState::Running {
                return Err(FactoryError::agent("online_cpu_mem", id, "VM not running"));
            }
            Ok(())
        })
    }
}
