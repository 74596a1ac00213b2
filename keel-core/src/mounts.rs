//! Mount reaper: unmounts everything beneath a path.
//!
//! The kernel mount table can change between reading it and issuing an
//! unmount, and a single unmount may cascade submounts away, so the table is
//! re-read and the scan restarted after every successful unmount. The loop
//! ends when a full scan finds no remaining target.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use tracing::debug;

use crate::error::{KeelError, Result};

const MOUNT_TABLE: &str = "/proc/mounts";

/// Unmount `path` itself and every mountpoint beneath it.
pub fn unmount_tree(path: &Path) -> Result<()> {
    let mut skipped: HashSet<String> = HashSet::new();
    loop {
        let table = fs::read_to_string(MOUNT_TABLE)
            .map_err(|e| KeelError::io(MOUNT_TABLE, e))?;
        let Some(target) = select_target(&table, path, &skipped) else {
            return Ok(());
        };
        match umount2(target.as_str(), MntFlags::empty()) {
            Ok(()) => debug!(mountpoint = %target, "unmounted"),
            // Raced with another unmount; treat as progress and filter the
            // entry out of subsequent scans.
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                skipped.insert(target);
            }
            Err(e) => {
                return Err(KeelError::Internal(format!("unmounting {target}: {e}")));
            }
        }
    }
}

/// Pick the deepest mountpoint at or beneath `path`, so submounts go first.
fn select_target(table: &str, path: &Path, skipped: &HashSet<String>) -> Option<String> {
    let root = path.to_string_lossy();
    let prefix = format!("{root}/");
    let mut deepest: Option<String> = None;
    for line in table.lines() {
        let Some(field) = line.split_whitespace().nth(1) else { continue };
        let mountpoint = unescape(field);
        if mountpoint != root && !mountpoint.starts_with(&prefix) {
            continue;
        }
        if skipped.contains(&mountpoint) {
            continue;
        }
        if deepest.as_ref().map_or(true, |d| mountpoint.len() > d.len()) {
            deepest = Some(mountpoint);
        }
    }
    deepest
}

/// Undo the octal escapes the kernel uses in `/proc/mounts` fields.
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut bytes = field.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b as char);
            continue;
        }
        let digits: Vec<u8> = bytes.by_ref().take(3).collect();
        match std::str::from_utf8(&digits).ok().and_then(|s| u8::from_str_radix(s, 8).ok()) {
            Some(value) => out.push(value as char),
            None => {
                out.push('\\');
                for d in digits {
                    out.push(d as char);
                }
            }
        }
    }
    out
}
