// ============================================================================
// File: src/backends/trait_def.rs
// ----------------------------------------------------------------------------
// BaseVmBackend trait definition
// ============================================================================

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::VMConfig;
use crate::error::{FactoryError, FactoryResult};
use crate::vm::{Vm, VmStatus};

/// Status of one pooled slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolVmStatus {
    /// True once the entry has been handed to a caller
    pub occupied: bool,

    /// Sizing of the VM in (or last seen in) this slot
    pub vm: VmStatus,
}

/// Source of base VMs
///
/// Implemented by the direct, template, cache and remote-cache backends.
/// A base VM is fully booted, paused, and ready to be resumed and resized
/// to an exact request; ownership of each returned [`Vm`] moves to the
/// caller and never comes back.
#[async_trait]
pub trait BaseVmBackend: Send + Sync + fmt::Debug {
    /// The configuration base VMs from this backend are built for
    fn config(&self) -> VMConfig;

    /// Fetch one paused base VM
    ///
    /// # Arguments
    /// * `config` - the requesting caller's config; backends that build
    ///   per-request VMs honor it, pooling backends ignore it
    async fn get_base_vm(&self, config: &VMConfig) -> FactoryResult<Vm>;

    /// Release everything the backend holds
    ///
    /// Pooled-but-unclaimed VMs are stopped; persisted template state is
    /// destroyed.
    async fn close(&self) -> FactoryResult<()>;

    /// Report pooled-slot occupancy
    ///
    /// Only pooling backends support this; the rest return a typed
    /// `StatusUnsupported` error.
    fn vm_status(&self) -> FactoryResult<Vec<PoolVmStatus>> {
        Err(FactoryError::StatusUnsupported {
            backend: self.backend_type(),
        })
    }

    /// Backend identifier used in logs and errors
    fn backend_type(&self) -> &'static str;
}
