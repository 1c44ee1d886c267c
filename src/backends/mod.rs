// ============================================================================
// File: src/backends/mod.rs
// ----------------------------------------------------------------------------
// Base-VM backend implementations
// ============================================================================

pub mod cache;
pub mod direct;
pub mod remote;
pub mod template;
pub mod trait_def;

pub use cache::CacheBackend;
pub use direct::DirectBackend;
pub use remote::RemoteCacheBackend;
pub use remote::server::RemoteCacheServer;
pub use template::TemplateBackend;
pub use trait_def::{BaseVmBackend, PoolVmStatus};
