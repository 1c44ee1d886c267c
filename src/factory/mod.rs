// ============================================================================
// File: src/factory/mod.rs
// ----------------------------------------------------------------------------
// Factory orchestrator: selects and composes the backend chain from
// configuration, validates and reconciles requested vs. base configs, and
// performs post-fetch hotplug adjustment.
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backends::cache::CacheBackend;
use crate::backends::direct::DirectBackend;
use crate::backends::remote::RemoteCacheBackend;
use crate::backends::template::ramdisk::Ramdisk;
use crate::backends::template::{DEFAULT_SETTLE_TIMEOUT, TemplateBackend};
use crate::backends::trait_def::{BaseVmBackend, PoolVmStatus};
use crate::config::VMConfig;
use crate::error::{FactoryError, FactoryResult};
use crate::hypervisor::{Hypervisor, VmmHandles};
use crate::vm::Vm;

/// Configuration selecting and sizing the backend chain
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Build (or attach to) a template backend instead of direct creation
    pub use_template: bool,

    /// Fetch base VMs from the cache daemon instead of any local backend
    pub use_remote_cache: bool,

    /// Local pool capacity; 0 disables pooling
    pub cache_size: u32,

    /// Directory holding the template snapshot pair
    pub template_path: PathBuf,

    /// Unix socket the cache daemon listens on
    pub remote_cache_endpoint: PathBuf,

    /// Configuration base VMs are built for
    pub vm_config: VMConfig,

    /// Attach to existing template state instead of creating it
    pub fetch_only: bool,

    /// Worst-case wait for the guest control channel during template
    /// construction
    pub template_settle_timeout: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            use_template: false,
            use_remote_cache: false,
            cache_size: 0,
            template_path: PathBuf::from("/run/vmfactory/template"),
            remote_cache_endpoint: PathBuf::from("/run/vmfactory/cache.sock"),
            vm_config: VMConfig::default(),
            fetch_only: false,
            template_settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }
}

/// Stops a checked-out VM if its caller gives up mid-preparation
///
/// Armed right after the fetch; every preparation await is a point where
/// the caller's future can be dropped, and a dropped `Vm` on its own would
/// stay alive in the hypervisor forever.
struct StopOnDrop {
    id: String,
    hypervisor: Arc<dyn Hypervisor>,
    armed: bool,
}

impl StopOnDrop {
    fn arm(vm: &Vm, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            id: vm.id().to_string(),
            hypervisor,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let hypervisor = self.hypervisor.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = hypervisor.stop_vm(&id).await {
                        log::warn!("failed to stop abandoned VM {id}: {e}");
                    }
                });
            }
            Err(_) => log::warn!("no runtime left to stop abandoned VM {id}"),
        }
    }
}

/// Orchestrator handing out ready-to-use VMs
///
/// Every `get_vm` call is independent; the factory applies no global
/// serialization across callers.
#[derive(Debug)]
pub struct Factory {
    backend: Arc<dyn BaseVmBackend>,
    handles: VmmHandles,
}

impl Factory {
    /// Validate `config` and build the backend chain it selects
    ///
    /// Selection, first match wins: remote cache; template (freshly built,
    /// or attached when `fetch_only`) optionally wrapped in a local pool;
    /// direct creation, likewise optionally wrapped.
    pub async fn new(
        config: FactoryConfig,
        handles: VmmHandles,
        ramdisk: Arc<dyn Ramdisk>,
    ) -> FactoryResult<Self> {
        config.vm_config.valid()?;

        if config.fetch_only && config.cache_size > 0 {
            // Only templates support attach-without-create; a pool has to be
            // built fresh.
            return Err(FactoryError::invalid_config(
                "fetch_only cannot be combined with a cache size",
            ));
        }

        let backend: Arc<dyn BaseVmBackend> = if config.use_remote_cache {
            if config.cache_size > 0 {
                log::debug!("cache size ignored: the remote side already pools");
            }
            Arc::new(
                RemoteCacheBackend::new(config.remote_cache_endpoint, handles.clone()).await?,
            )
        } else {
            let base: Arc<dyn BaseVmBackend> = if config.use_template {
                let template = if config.fetch_only {
                    TemplateBackend::fetch(
                        config.vm_config,
                        config.template_path,
                        handles.clone(),
                        ramdisk,
                    )?
                } else {
                    TemplateBackend::new(
                        config.vm_config,
                        config.template_path,
                        handles.clone(),
                        ramdisk,
                        config.template_settle_timeout,
                    )
                    .await?
                };
                Arc::new(template)
            } else {
                Arc::new(DirectBackend::new(config.vm_config, handles.clone()))
            };

            if config.cache_size > 0 {
                CacheBackend::new(base, config.cache_size as usize)
            } else {
                base
            }
        };

        log::info!("VM factory ready over {} backend", backend.backend_type());
        Ok(Self { backend, handles })
    }

    /// The configuration the backend chain builds base VMs for
    pub fn config(&self) -> VMConfig {
        self.backend.config()
    }

    /// Produce a running VM sized exactly to `requested`
    ///
    /// A request incompatible with the base config is served by transient
    /// direct creation instead of failing. Whatever the source, the VM is
    /// resumed, its RNG reseeded, its clock re-synchronized, and any vCPU or
    /// memory shortfall hot-added and onlined. Every error branch after the
    /// fetch stops the VM before propagating, and a caller that drops the
    /// future mid-preparation has the VM stopped in the background.
    pub async fn get_vm(&self, requested: &VMConfig) -> FactoryResult<Vm> {
        requested.valid()?;

        let base_config = self.backend.config();
        let mut vm = if base_config.compatible(requested) {
            self.backend.get_base_vm(requested).await?
        } else {
            log::info!(
                "requested config incompatible with {} backend, creating directly",
                self.backend.backend_type()
            );
            let direct = DirectBackend::new(requested.clone(), self.handles.clone());
            direct.get_base_vm(requested).await?
        };

        let guard = StopOnDrop::arm(&vm, self.handles.hypervisor.clone());
        if let Err(e) = self.prepare_vm(&mut vm, requested).await {
            guard.disarm();
            if let Err(stop_err) = vm.stop().await {
                log::warn!("failed to stop VM {}: {stop_err}", vm.id());
            }
            return Err(e);
        }
        guard.disarm();

        Ok(vm)
    }

    /// Resume and reconcile a fetched base VM against the request
    async fn prepare_vm(&self, vm: &mut Vm, requested: &VMConfig) -> FactoryResult<()> {
        vm.resume().await?;

        // Clones of one snapshot share a PRNG state and a stale clock.
        vm.reseed_rng().await?;
        vm.sync_time().await?;

        let wanted = &requested.hypervisor_config;
        let mut hotplugged = false;
        if wanted.num_vcpus > vm.cpus() {
            vm.add_cpus(wanted.num_vcpus - vm.cpus()).await?;
            hotplugged = true;
        }
        if wanted.memory_size_mb > vm.memory_mb() {
            vm.add_memory(wanted.memory_size_mb - vm.memory_mb()).await?;
            hotplugged = true;
        }
        if hotplugged {
            vm.online_cpu_mem().await?;
        }

        Ok(())
    }

    /// Report pooled-slot occupancy of the backend chain
    pub fn vm_status(&self) -> FactoryResult<Vec<PoolVmStatus>> {
        self.backend.vm_status()
    }

    /// Release the backend chain and everything it holds
    pub async fn close(&self) -> FactoryResult<()> {
        self.backend.close().await
    }
}

#[cfg(test)]
mod tests;
