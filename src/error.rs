// ============================================================================
// File: src/error.rs
// ----------------------------------------------------------------------------
// Factory-wide error types
// ============================================================================

use std::path::PathBuf;

/// Errors produced by the VM factory and its backends
///
/// Config incompatibility is deliberately absent: a base/requested mismatch
/// is not an error condition, it routes the request to the direct fallback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FactoryError {
    /// Requested VM configuration failed static validation
    #[error("Invalid VM configuration: {details}")]
    InvalidConfig { details: String },

    /// Template path already holds a populated snapshot
    #[error("Template path {path} already holds a populated snapshot")]
    TemplateExists { path: PathBuf },

    /// Template snapshot file is missing from the template path
    #[error("Template path {path} is missing the {file} file")]
    TemplateMissing { path: PathBuf, file: &'static str },

    /// Backend could not be constructed
    #[error("Backend {backend} construction failed: {details}")]
    BackendFailed {
        backend: &'static str,
        details: String,
    },

    /// Hypervisor operation on a VM failed
    #[error("Hypervisor operation '{op}' failed for VM {id}: {details}")]
    Hypervisor {
        op: &'static str,
        id: String,
        details: String,
    },

    /// Guest agent operation on a VM failed
    #[error("Guest agent operation '{op}' failed for VM {id}: {details}")]
    Agent {
        op: &'static str,
        id: String,
        details: String,
    },

    /// Remote cache call failed
    #[error("Remote cache call '{call}' failed: {details}")]
    Rpc {
        call: &'static str,
        details: String,
    },

    /// The VM pool has been closed
    #[error("VM pool is closed")]
    PoolClosed,

    /// Backend does not support VM status queries
    #[error("Backend {backend} does not support VM status queries")]
    StatusUnsupported { backend: &'static str },

    /// Filesystem or ramdisk operation failed
    #[error("Storage operation failed: {details}")]
    Storage { details: String },
}

impl FactoryError {
    /// Create an invalid-configuration error
    pub fn invalid_config<D: Into<String>>(details: D) -> Self {
        Self::InvalidConfig {
            details: details.into(),
        }
    }

    /// Create a backend-construction error
    pub fn backend_failed<D: Into<String>>(backend: &'static str, details: D) -> Self {
        Self::BackendFailed {
            backend,
            details: details.into(),
        }
    }

    /// Create a hypervisor-operation error
    pub fn hypervisor<I: Into<String>, D: Into<String>>(
        op: &'static str,
        id: I,
        details: D,
    ) -> Self {
        Self::Hypervisor {
            op,
            id: id.into(),
            details: details.into(),
        }
    }

    /// Create a guest-agent-operation error
    pub fn agent<I: Into<String>, D: Into<String>>(op: &'static str, id: I, details: D) -> Self {
        Self::Agent {
            op,
            id: id.into(),
            details: details.into(),
        }
    }

    /// Create a remote-call error
    pub fn rpc<D: Into<String>>(call: &'static str, details: D) -> Self {
        Self::Rpc {
            call,
            details: details.into(),
        }
    }

    /// Create a storage error
    pub fn storage<D: Into<String>>(details: D) -> Self {
        Self::Storage {
            details: details.into(),
        }
    }
}

/// Result type for factory operations
pub type FactoryResult<T> = Result<T, FactoryError>;
