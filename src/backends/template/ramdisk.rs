// ============================================================================
// File: src/backends/template/ramdisk.rs
// ----------------------------------------------------------------------------
// RAM-backed directory management for template snapshot state.
//
// Defines the interface the template backend uses to create and tear down
// the directory its snapshot files live in, with a tmpfs implementation
// for production and a plain-directory implementation for unprivileged
// environments and tests.
// ============================================================================

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{FactoryError, FactoryResult};

/// RAM-backed directory operations for template state
pub trait Ramdisk: Send + Sync + fmt::Debug {
    /// Create a RAM-backed directory of `size_mb` MiB at `mount_point`
    fn create(&self, mount_point: &Path, size_mb: u32) -> FactoryResult<()>;

    /// Tear down the directory at `mount_point` and everything in it
    fn remove(&self, mount_point: &Path) -> FactoryResult<()>;
}

/// tmpfs-backed implementation
///
/// Requires mount privileges; the mount is sized so a runaway snapshot
/// cannot consume unbounded host memory.
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct TmpfsRamdisk;

#[cfg(target_os = "linux")]
impl Ramdisk for TmpfsRamdisk {
    fn create(&self, mount_point: &Path, size_mb: u32) -> FactoryResult<()> {
        use nix::mount::{MsFlags, mount};

        fs::create_dir_all(mount_point)
            .map_err(|e| FactoryError::storage(format!("mkdir {}: {e}", mount_point.display())))?;

        let options = format!("size={size_mb}M");
        mount(
            Some("tmpfs"),
            mount_point,
            Some("tmpfs"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| {
            FactoryError::storage(format!("mount tmpfs at {}: {e}", mount_point.display()))
        })
    }

    fn remove(&self, mount_point: &Path) -> FactoryResult<()> {
        use nix::mount::umount;

        umount(mount_point).map_err(|e| {
            FactoryError::storage(format!("umount {}: {e}", mount_point.display()))
        })?;
        fs::remove_dir_all(mount_point)
            .map_err(|e| FactoryError::storage(format!("rmdir {}: {e}", mount_point.display())))
    }
}

/// Plain-directory implementation
///
/// No RAM backing and no size cap. Used by tests and by hosts where the
/// factory runs without mount privileges.
#[derive(Debug, Default)]
pub struct PlainDirRamdisk;

impl Ramdisk for PlainDirRamdisk {
    fn create(&self, mount_point: &Path, _size_mb: u32) -> FactoryResult<()> {
        fs::create_dir_all(mount_point)
            .map_err(|e| FactoryError::storage(format!("mkdir {}: {e}", mount_point.display())))
    }

    fn remove(&self, mount_point: &Path) -> FactoryResult<()> {
        fs::remove_dir_all(mount_point)
            .map_err(|e| FactoryError::storage(format!("rmdir {}: {e}", mount_point.display())))
    }
}
