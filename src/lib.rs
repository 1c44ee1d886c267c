// ============================================================================
// File: src/lib.rs
// ----------------------------------------------------------------------------
// vmfactory: base-VM factory for hardware-isolated sandboxes.
// ============================================================================

//! Accelerated creation of hardware-isolated sandbox VMs.
//!
//! Booting a guest for every sandbox request is slow; this crate amortizes
//! that cost behind a small family of interchangeable backends unified by
//! one orchestrator:
//!
//! - [`backends::DirectBackend`] boots a fresh VM per request.
//! - [`backends::TemplateBackend`] boots one guest, freezes its memory and
//!   device state into a RAM-backed directory, and restores cheap clones.
//! - [`backends::CacheBackend`] keeps a bounded pool of pre-fetched base
//!   VMs ahead of demand over any other backend.
//! - [`backends::RemoteCacheBackend`] shares one cache daemon between
//!   every factory process on a host, over a local unix socket.
//!
//! [`factory::Factory`] selects the chain from configuration, validates
//! requests, falls back to direct creation when a request is incompatible
//! with the base image, and reconciles sizing by hotplugging vCPUs and
//! memory after the fetch. The hypervisor-management layer and the guest
//! agent stay behind the [`hypervisor::Hypervisor`] and
//! [`hypervisor::GuestAgent`] traits; everything here is strictly
//! single-host.

pub mod backends;
pub mod config;
pub mod error;
pub mod factory;
pub mod hypervisor;
pub mod vm;

pub use backends::{BaseVmBackend, CacheBackend, DirectBackend, PoolVmStatus};
pub use backends::{RemoteCacheBackend, RemoteCacheServer, TemplateBackend};
pub use config::{HypervisorConfig, HypervisorType, VMConfig};
pub use error::{FactoryError, FactoryResult};
pub use factory::{Factory, FactoryConfig};
pub use hypervisor::{GuestAgent, Hypervisor, VmmHandles};
pub use vm::{Vm, VmSnapshotHandle, VmStatus};
