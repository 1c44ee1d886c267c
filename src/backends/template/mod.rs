// ============================================================================
// File: src/backends/template/mod.rs
// ----------------------------------------------------------------------------
// Template backend: boots exactly one guest, freezes its memory and device
// state into a RAM-backed directory, and materializes cheap clones from the
// snapshot on demand.
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};

use crate::config::VMConfig;
use crate::error::{FactoryError, FactoryResult};
use crate::hypervisor::VmmHandles;
use crate::vm::Vm;

use super::trait_def::BaseVmBackend;

pub mod ramdisk;

use ramdisk::Ramdisk;

/// Overhead reserved in the RAM-backed directory for device state, MiB
pub const TEMPLATE_DEVICE_STATE_SIZE_MB: u32 = 8;

/// Worst-case wait for the guest control channel to come back after the
/// template boot tears it down
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

const MEMORY_FILE: &str = "memory";
const STATE_FILE: &str = "state";

/// Backend that amortizes boot cost through snapshot/clone
///
/// The snapshot pair is written once at construction and is read-only from
/// then on; concurrent clone calls share it without locking.
#[derive(Debug)]
pub struct TemplateBackend {
    config: VMConfig,
    state_path: PathBuf,
    handles: VmmHandles,
    ramdisk: Arc<dyn Ramdisk>,
}

impl TemplateBackend {
    /// Boot a template VM, persist its snapshot under `state_path`, stop it
    ///
    /// Fails with `TemplateExists` if `state_path` already holds a populated
    /// snapshot. Any later step failing rolls the whole construction back:
    /// the template VM is stopped and the RAM-backed directory removed.
    ///
    /// # Arguments
    /// * `settle_timeout` - worst-case wait for the guest control channel to
    ///   finish its restart cycle before the snapshot is taken
    pub async fn new(
        config: VMConfig,
        state_path: PathBuf,
        handles: VmmHandles,
        ramdisk: Arc<dyn Ramdisk>,
        settle_timeout: Duration,
    ) -> FactoryResult<Self> {
        config.valid()?;

        let backend = Self {
            config,
            state_path,
            handles,
            ramdisk,
        };

        if backend.is_populated() {
            return Err(FactoryError::TemplateExists {
                path: backend.state_path.clone(),
            });
        }

        let size_mb = backend.config.hypervisor_config.memory_size_mb + TEMPLATE_DEVICE_STATE_SIZE_MB;
        backend.ramdisk.create(&backend.state_path, size_mb)?;

        if let Err(e) = backend.create_template_vm(settle_timeout).await {
            if let Err(cleanup_err) = backend.ramdisk.remove(&backend.state_path) {
                log::warn!(
                    "template rollback: failed to remove {}: {cleanup_err}",
                    backend.state_path.display()
                );
            }
            return Err(e);
        }

        Ok(backend)
    }

    /// Attach to a snapshot a previous [`TemplateBackend::new`] produced
    ///
    /// Never creates anything; fails with `TemplateMissing` when either
    /// snapshot file is absent.
    pub fn fetch(
        config: VMConfig,
        state_path: PathBuf,
        handles: VmmHandles,
        ramdisk: Arc<dyn Ramdisk>,
    ) -> FactoryResult<Self> {
        config.valid()?;

        for file in [MEMORY_FILE, STATE_FILE] {
            if !state_path.join(file).is_file() {
                return Err(FactoryError::TemplateMissing {
                    path: state_path,
                    file,
                });
            }
        }

        Ok(Self {
            config,
            state_path,
            handles,
            ramdisk,
        })
    }

    fn memory_file(&self) -> PathBuf {
        self.state_path.join(MEMORY_FILE)
    }

    fn state_file(&self) -> PathBuf {
        self.state_path.join(STATE_FILE)
    }

    fn is_populated(&self) -> bool {
        self.memory_file()
            .metadata()
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    /// Boot the one template VM, settle the agent, then freeze and persist it
    async fn create_template_vm(&self, settle_timeout: Duration) -> FactoryResult<()> {
        let mut template_config = self.config.clone();
        let hc = &mut template_config.hypervisor_config;
        hc.boot_to_template = true;
        hc.boot_from_template = false;
        hc.memory_path = self.memory_file();
        hc.devices_state_path = self.state_file();

        let vm = Vm::new(&self.handles, template_config).await?;

        if let Err(e) = self.freeze(&vm, settle_timeout).await {
            if let Err(stop_err) = vm.stop().await {
                log::warn!("failed to stop template VM {}: {stop_err}", vm.id());
            }
            return Err(e);
        }

        // The snapshot pair now carries everything clones boot from; keeping
        // the template VM alive would pin its whole memory footprint.
        vm.stop().await?;

        log::info!(
            "template snapshot persisted under {}",
            self.state_path.display()
        );
        Ok(())
    }

    async fn freeze(&self, vm: &Vm, settle_timeout: Duration) -> FactoryResult<()> {
        // The guest control channel restarts after the template boot tears it
        // down; poll until it answers, bounded by the worst-case delay.
        let deadline = Instant::now() + settle_timeout;
        loop {
            if self.handles.agent.check(vm.id()).await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "guest control channel for template VM {} not ready after {settle_timeout:?}",
                    vm.id()
                );
                break;
            }
            sleep(SETTLE_POLL_INTERVAL).await;
        }

        vm.disconnect().await?;
        vm.pause().await?;
        vm.save().await
    }
}

#[async_trait]
impl BaseVmBackend for TemplateBackend {
    fn config(&self) -> VMConfig {
        self.config.clone()
    }

    async fn get_base_vm(&self, config: &VMConfig) -> FactoryResult<Vm> {
        let mut clone_config = self.config.clone();
        let hc = &mut clone_config.hypervisor_config;
        hc.boot_to_template = false;
        hc.boot_from_template = true;
        hc.memory_path = self.memory_file();
        hc.devices_state_path = self.state_file();
        // The snapshot is shared; the storage paths are the caller's own.
        hc.vm_store_path = config.hypervisor_config.vm_store_path.clone();
        hc.run_store_path = config.hypervisor_config.run_store_path.clone();

        Vm::new(&self.handles, clone_config).await
    }

    async fn close(&self) -> FactoryResult<()> {
        if let Err(e) = self.ramdisk.remove(&self.state_path) {
            log::warn!(
                "failed to remove template state {}: {e}",
                self.state_path.display()
            );
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "template"
    }
}
