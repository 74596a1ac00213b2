//! Centralized path configuration for keel.
//!
//! All data paths go through this module so the CLI and the engine agree on
//! where stored data, long-lived mounts and ephemeral runtime files live.

use std::path::PathBuf;

/// Get the keel data directory.
///
/// Resolution order:
/// 1. `KEEL_DATA_DIR` environment variable
/// 2. `/var/lib/keel` if it exists (system install)
/// 3. `~/.keel` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KEEL_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/keel");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".keel")).unwrap_or(system_dir)
}

/// Get the directory under which long-lived mounts are placed.
pub fn mounts_dir() -> PathBuf {
    data_dir().join("mounts")
}

/// Get the runtime directory for executor sockets and other ephemeral files.
///
/// Resolution order:
/// 1. `KEEL_RUNTIME_DIR` environment variable
/// 2. `$XDG_RUNTIME_DIR/keel` if XDG_RUNTIME_DIR is set
/// 3. `/run/keel` if running as root
/// 4. `/tmp/keel-runtime` as fallback
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KEEL_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(xdg).join("keel");
    }

    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } == 0 {
            return PathBuf::from("/run/keel");
        }
    }

    PathBuf::from("/tmp/keel-runtime")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_consistency() {
        assert!(mounts_dir().starts_with(data_dir()));
    }
}
