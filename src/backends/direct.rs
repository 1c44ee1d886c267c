// ============================================================================
// File: src/backends/direct.rs
// ----------------------------------------------------------------------------
// Direct backend: boots a fresh VM per request, no persisted state.
// ============================================================================

use async_trait::async_trait;

use crate::config::VMConfig;
use crate::error::FactoryResult;
use crate::hypervisor::VmmHandles;
use crate::vm::Vm;

use super::trait_def::BaseVmBackend;

/// Backend that creates every base VM from scratch
///
/// Also serves as the fallback path when a request is incompatible with the
/// accelerated backend's config.
#[derive(Debug)]
pub struct DirectBackend {
    config: VMConfig,
    handles: VmmHandles,
}

impl DirectBackend {
    /// Create a direct backend over `config`
    pub fn new(config: VMConfig, handles: VmmHandles) -> Self {
        Self { config, handles }
    }
}

#[async_trait]
impl BaseVmBackend for DirectBackend {
    fn config(&self) -> VMConfig {
        self.config.clone()
    }

    async fn get_base_vm(&self, config: &VMConfig) -> FactoryResult<Vm> {
        let vm = Vm::new(&self.handles, config.clone()).await?;

        // Base VMs are handed out paused.
        if let Err(e) = vm.pause().await {
            if let Err(stop_err) = vm.stop().await {
                log::warn!("failed to stop VM {} after pause error: {stop_err}", vm.id());
            }
            return Err(e);
        }

        Ok(vm)
    }

    async fn close(&self) -> FactoryResult<()> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "direct"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HypervisorType;
    use crate::error::FactoryError;
    use crate::hypervisor::mock::{MockRunState, MockVmm};

    #[tokio::test]
    async fn fresh_paused_vm_per_request() {
        let vmm = MockVmm::new();
        let backend = DirectBackend::new(VMConfig::new(HypervisorType::Qemu, 1, 256), vmm.handles());

        let first = backend
            .get_base_vm(&backend.config())
            .await
            .expect("first VM");
        let second = backend
            .get_base_vm(&backend.config())
            .await
            .expect("second VM");

        assert_ne!(first.id(), second.id());
        assert_eq!(
            vmm.state(first.id()).expect("state").run_state,
            MockRunState::Paused
        );
        assert_eq!(vmm.created_count(), 2);
    }

    #[tokio::test]
    async fn status_is_unsupported() {
        let vmm = MockVmm::new();
        let backend = DirectBackend::new(VMConfig::new(HypervisorType::Qemu, 1, 256), vmm.handles());

        match backend.vm_status() {
            Err(FactoryError::StatusUnsupported { backend }) => assert_eq!(backend, "direct"),
            other => panic!("expected StatusUnsupported, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pause_failure_stops_the_vm() {
        let vmm = MockVmm::new();
        let backend = DirectBackend::new(VMConfig::new(HypervisorType::Qemu, 1, 256), vmm.handles());

        vmm.fail_op("pause_vm");
        assert!(backend.get_base_vm(&backend.config()).await.is_err());
        assert_eq!(vmm.live_count(), 0);
    }
}
