//! Scoped process root switching.
//!
//! [`enter`] acquires a new root view and hands back a guard whose
//! [`RootGuard::exit`] restores the original view. The guard must be
//! consumed on every path out of the scope; restoring the root is not
//! something the process can survive skipping.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::unistd::{chdir, chroot};

use crate::error::{KeelError, Result};

/// Restores the previous process root when consumed.
pub struct RootGuard {
    old_root: Option<File>,
}

/// Switch the process root to `path`.
///
/// Requires privileges for `chroot(2)`.
pub fn enter(path: &Path) -> Result<RootGuard> {
    let old_root = File::open("/").map_err(|e| KeelError::io("/", e))?;
    chroot(path)
        .map_err(|e| KeelError::Internal(format!("chroot into {}: {e}", path.display())))?;
    chdir("/").map_err(|e| KeelError::Internal(format!("chdir after chroot: {e}")))?;
    Ok(RootGuard { old_root: Some(old_root) })
}

impl RootGuard {
    /// Restore the original root view.
    pub fn exit(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        let Some(old_root) = self.old_root.take() else {
            return Ok(());
        };
        if unsafe { libc::fchdir(old_root.as_raw_fd()) } != 0 {
            let err = std::io::Error::last_os_error();
            return Err(KeelError::Internal(format!("returning to original root: {err}")));
        }
        chroot(".").map_err(|e| KeelError::Internal(format!("restoring original root: {e}")))?;
        Ok(())
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        if self.old_root.is_none() {
            return;
        }
        // A process stuck inside the wrong root cannot continue safely.
        if let Err(err) = self.restore() {
            panic!("failed to restore process root: {err}");
        }
    }
}
