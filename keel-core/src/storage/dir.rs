//! Directory-backed storage driver.
//!
//! Each build owns one dataset directory:
//!
//! ```text
//! <data>/builds/<build-id>/meta.json       name and creation time
//! <data>/builds/<build-id>/fs/             dataset tree, bind-mounted at the working path
//! <data>/builds/<build-id>/manifest.json   present once the build is sealed
//! <data>/builds/<build-id>/mounted         current mountpoint, present only while mounted
//! <data>/tags/<name>:<tag>                 tag index entry, content is the build id
//! ```
//!
//! Cloning copies the `fs/` tree; on a copy-on-write filesystem the copy is
//! cheap at the block level, but nothing here depends on that.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::error::{KeelError, Result};
use crate::mounts;
use crate::paths;
use crate::storage::{Driver, UnmountFn};
use crate::types::{BuildId, BuildInfo, BuildKey, ImageManifest, Tag};

const META_FILE: &str = "meta.json";
const MANIFEST_FILE: &str = "manifest.json";
const MOUNTED_FILE: &str = "mounted";
const FS_DIR: &str = "fs";

/// Dataset bookkeeping written at creation time.
#[derive(Debug, Serialize, Deserialize)]
struct DatasetMeta {
    build_id: BuildId,
    name: String,
    created_at: SystemTime,
}

/// Directory-per-dataset storage driver.
pub struct DirDriver {
    root: PathBuf,
}

impl DirDriver {
    /// Driver over the default data directory.
    pub fn new() -> Self {
        Self { root: paths::data_dir() }
    }

    /// Driver over a custom data directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn builds_dir(&self) -> PathBuf {
        self.root.join("builds")
    }

    fn tags_dir(&self) -> PathBuf {
        self.root.join("tags")
    }

    fn dataset_dir(&self, id: &BuildId) -> PathBuf {
        self.builds_dir().join(id.to_string())
    }

    fn fs_dir(&self, id: &BuildId) -> PathBuf {
        self.dataset_dir(id).join(FS_DIR)
    }

    fn read_meta(&self, id: &BuildId) -> Result<DatasetMeta> {
        read_json(&self.dataset_dir(id).join(META_FILE))
            .ok_or_else(|| KeelError::ImageDoesNotExist { what: id.to_string() })
    }

    fn write_meta(&self, id: &BuildId, name: &str) -> Result<()> {
        let meta = DatasetMeta {
            build_id: id.clone(),
            name: name.to_string(),
            created_at: SystemTime::now(),
        };
        write_json(&self.dataset_dir(id).join(META_FILE), &meta)
    }

    /// Tag index entries pointing at `id`, as `(path, key)` pairs.
    fn tag_entries(&self, id: &BuildId) -> Result<Vec<(PathBuf, BuildKey)>> {
        let tags_dir = self.tags_dir();
        let mut entries = Vec::new();
        let dir = match fs::read_dir(&tags_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(KeelError::io(&tags_dir, e)),
        };
        for entry in dir {
            let entry = entry.map_err(|e| KeelError::io(&tags_dir, e))?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if file_name.starts_with('.') {
                continue;
            }
            let Ok(key) = BuildKey::parse(file_name) else { continue };
            let Ok(content) = fs::read_to_string(&path) else { continue };
            match BuildId::parse(content.trim()) {
                Ok(pointee) if pointee == *id => entries.push((path, key)),
                _ => {}
            }
        }
        Ok(entries)
    }
}

impl Default for DirDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for DirDriver {
    fn create_empty(&self, name: &str, new_id: &BuildId) -> Result<()> {
        let dataset = self.dataset_dir(new_id);
        if dataset.exists() {
            return Err(KeelError::BuildExists { id: new_id.to_string() });
        }
        fs::create_dir_all(self.fs_dir(new_id)).map_err(|e| KeelError::io(&dataset, e))?;
        self.write_meta(new_id, name)?;
        debug!(build_id = %new_id, name, "created empty dataset");
        Ok(())
    }

    fn clone_build(&self, src_id: &BuildId, name: &str, new_id: &BuildId) -> Result<()> {
        self.read_meta(src_id)?;
        if !src_id.build_type().properties().cloneable {
            return Err(KeelError::SourceNotCloneable { id: src_id.to_string() });
        }
        let dataset = self.dataset_dir(new_id);
        if dataset.exists() {
            return Err(KeelError::BuildExists { id: new_id.to_string() });
        }
        fs::create_dir_all(&dataset).map_err(|e| KeelError::io(&dataset, e))?;
        copy_tree(&self.fs_dir(src_id), &self.fs_dir(new_id))?;
        self.write_meta(new_id, name)?;
        debug!(src = %src_id, build_id = %new_id, name, "cloned dataset");
        Ok(())
    }

    fn mount(&self, id: &BuildId, path: &Path) -> Result<UnmountFn> {
        self.read_meta(id)?;
        let fs_dir = self.fs_dir(id);
        nix::mount::mount(
            Some(&fs_dir),
            path,
            None::<&str>,
            nix::mount::MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| KeelError::Internal(format!("mounting {} at {}: {e}", id, path.display())))?;

        let mounted_file = self.dataset_dir(id).join(MOUNTED_FILE);
        fs::write(&mounted_file, path.display().to_string())
            .map_err(|e| KeelError::io(&mounted_file, e))?;
        debug!(build_id = %id, path = %path.display(), "mounted dataset");

        let target = path.to_path_buf();
        Ok(Box::new(move || {
            match nix::mount::umount2(&target, nix::mount::MntFlags::empty()) {
                Ok(()) => {}
                // Already gone counts as unmounted.
                Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
                Err(e) => {
                    return Err(KeelError::Internal(format!(
                        "unmounting {}: {e}",
                        target.display()
                    )))
                }
            }
            if let Err(e) = fs::remove_file(&mounted_file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(KeelError::io(&mounted_file, e));
                }
            }
            Ok(())
        }))
    }

    fn manifest(&self, id: &BuildId) -> Result<ImageManifest> {
        read_json(&self.dataset_dir(id).join(MANIFEST_FILE))
            .ok_or_else(|| KeelError::ImageDoesNotExist { what: id.to_string() })
    }

    fn store_manifest(&self, manifest: &ImageManifest) -> Result<()> {
        self.read_meta(&manifest.build_id)?;
        write_json(&self.dataset_dir(&manifest.build_id).join(MANIFEST_FILE), manifest)
    }

    fn build_id(&self, key: &BuildKey) -> Result<BuildId> {
        let entry = self.tags_dir().join(key.to_string());
        let content = match fs::read_to_string(&entry) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeelError::ImageDoesNotExist { what: key.to_string() })
            }
            Err(e) => return Err(KeelError::io(&entry, e)),
        };
        BuildId::parse(content.trim())
    }

    fn tag(&self, id: &BuildId, tag: &Tag) -> Result<()> {
        let meta = self.read_meta(id)?;
        let tags_dir = self.tags_dir();
        fs::create_dir_all(&tags_dir).map_err(|e| KeelError::io(&tags_dir, e))?;

        // Write-then-rename so the index entry repoints atomically.
        let entry = tags_dir.join(BuildKey::new(&meta.name, tag.clone()).to_string());
        let staged = tags_dir.join(format!(".staged-{id}"));
        fs::write(&staged, id.to_string()).map_err(|e| KeelError::io(&staged, e))?;
        fs::rename(&staged, &entry).map_err(|e| KeelError::io(&entry, e))?;
        debug!(build_id = %id, name = %meta.name, tag = %tag, "tagged build");
        Ok(())
    }

    fn drop_build(&self, id: &BuildId) -> Result<()> {
        let dataset = self.dataset_dir(id);
        self.read_meta(id)?;

        // Reap a stale mount left by a crashed session before deleting.
        let mounted_file = dataset.join(MOUNTED_FILE);
        if let Ok(mountpoint) = fs::read_to_string(&mounted_file) {
            if let Err(e) = mounts::unmount_tree(Path::new(mountpoint.trim())) {
                warn!(build_id = %id, error = %e, "failed to unmount dataset before drop");
            }
        }

        for (path, _key) in self.tag_entries(id)? {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(KeelError::io(&path, e));
                }
            }
        }
        fs::remove_dir_all(&dataset).map_err(|e| KeelError::io(&dataset, e))?;
        debug!(build_id = %id, "dropped build");
        Ok(())
    }

    fn builds(&self) -> Result<Vec<BuildId>> {
        let builds_dir = self.builds_dir();
        let dir = match fs::read_dir(&builds_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KeelError::io(&builds_dir, e)),
        };
        let mut ids = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|e| KeelError::io(&builds_dir, e))?;
            let name = entry.file_name();
            match name.to_str().map(BuildId::parse) {
                Some(Ok(id)) => ids.push(id),
                _ => warn!(entry = ?name, "skipping foreign entry in builds directory"),
            }
        }
        Ok(ids)
    }

    fn info(&self, id: &BuildId) -> Result<BuildInfo> {
        let meta = self.read_meta(id)?;
        let manifest: Option<ImageManifest> =
            read_json(&self.dataset_dir(id).join(MANIFEST_FILE));
        let mounted = fs::read_to_string(self.dataset_dir(id).join(MOUNTED_FILE))
            .ok()
            .map(|s| PathBuf::from(s.trim()));
        let tags = self.tag_entries(id)?.into_iter().map(|(_path, key)| key.tag).collect();

        Ok(BuildInfo {
            build_id: meta.build_id,
            based_on: manifest.as_ref().and_then(|m| m.based_on.clone()),
            name: meta.name,
            tags,
            created_at: meta.created_at,
            mounted,
            params: manifest.map(|m| m.params).unwrap_or_default(),
        })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| KeelError::Internal(format!("serializing {}: {e}", path.display())))?;
    fs::write(path, json).map_err(|e| KeelError::io(path, e))
}

/// Recursively copy a dataset tree, preserving symlinks and permissions.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| KeelError::io(dst, e))?;
    let metadata = fs::metadata(src).map_err(|e| KeelError::io(src, e))?;
    fs::set_permissions(dst, metadata.permissions()).map_err(|e| KeelError::io(dst, e))?;

    for entry in fs::read_dir(src).map_err(|e| KeelError::io(src, e))? {
        let entry = entry.map_err(|e| KeelError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| KeelError::io(&from, e))?;

        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from).map_err(|e| KeelError::io(&from, e))?;
            std::os::unix::fs::symlink(&target, &to).map_err(|e| KeelError::io(&to, e))?;
        } else {
            fs::copy(&from, &to).map_err(|e| KeelError::io(&to, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BuildType;
    use tempfile::TempDir;

    fn driver() -> (TempDir, DirDriver) {
        let dir = TempDir::new().unwrap();
        let driver = DirDriver::with_root(dir.path());
        (dir, driver)
    }

    fn image_id() -> BuildId {
        BuildId::generate(BuildType::Image)
    }

    #[test]
    fn test_create_empty_and_exists() {
        let (_dir, driver) = driver();
        let id = image_id();
        driver.create_empty("alpine", &id).unwrap();
        assert!(matches!(
            driver.create_empty("alpine", &id),
            Err(KeelError::BuildExists { .. })
        ));
        assert_eq!(driver.builds().unwrap(), vec![id.clone()]);

        let info = driver.info(&id).unwrap();
        assert_eq!(info.name, "alpine");
        assert!(info.tags.is_empty());
        assert!(info.based_on.is_none());
        assert!(info.mounted.is_none());
    }

    #[test]
    fn test_clone_copies_tree() {
        let (_dir, driver) = driver();
        let base = image_id();
        driver.create_empty("base", &base).unwrap();

        let fs_dir = driver.fs_dir(&base);
        fs::create_dir_all(fs_dir.join("root/etc")).unwrap();
        fs::write(fs_dir.join("root/etc/motd"), "hello").unwrap();
        std::os::unix::fs::symlink("etc/motd", fs_dir.join("root/motd")).unwrap();

        let child = image_id();
        driver.clone_build(&base, "child", &child).unwrap();

        let cloned = driver.fs_dir(&child);
        assert_eq!(fs::read_to_string(cloned.join("root/etc/motd")).unwrap(), "hello");
        assert_eq!(
            fs::read_link(cloned.join("root/motd")).unwrap(),
            PathBuf::from("etc/motd")
        );
    }

    #[test]
    fn test_clone_errors() {
        let (_dir, driver) = driver();
        let missing = image_id();
        let new = image_id();
        assert!(driver
            .clone_build(&missing, "x", &new)
            .unwrap_err()
            .is_not_exist());

        let base = image_id();
        driver.create_empty("base", &base).unwrap();
        let mount = BuildId::generate(BuildType::Mount);
        driver.clone_build(&base, "m", &mount).unwrap();
        assert!(matches!(
            driver.clone_build(&mount, "x", &image_id()),
            Err(KeelError::SourceNotCloneable { .. })
        ));
    }

    #[test]
    fn test_manifest_roundtrip_identity() {
        let (_dir, driver) = driver();
        let id = image_id();
        let parent = image_id();
        driver.create_empty("app", &id).unwrap();

        assert!(driver.manifest(&id).unwrap_err().is_not_exist());

        let manifest = ImageManifest {
            build_id: id.clone(),
            based_on: Some(parent),
            params: vec!["quiet".to_string(), "quiet".to_string()],
        };
        driver.store_manifest(&manifest).unwrap();
        assert_eq!(driver.manifest(&id).unwrap(), manifest);
    }

    #[test]
    fn test_tag_transfer_is_injective() {
        let (_dir, driver) = driver();
        let first = image_id();
        let second = image_id();
        driver.create_empty("app", &first).unwrap();
        driver.create_empty("app", &second).unwrap();

        let tag = Tag::default();
        let key = BuildKey::new("app", tag.clone());
        driver.tag(&first, &tag).unwrap();
        assert_eq!(driver.build_id(&key).unwrap(), first);

        // Re-tagging moves the key off the prior holder.
        driver.tag(&second, &tag).unwrap();
        assert_eq!(driver.build_id(&key).unwrap(), second);
        assert!(driver.info(&first).unwrap().tags.is_empty());
        assert_eq!(driver.info(&second).unwrap().tags, vec![tag]);
    }

    #[test]
    fn test_build_id_miss() {
        let (_dir, driver) = driver();
        assert!(driver
            .build_id(&BuildKey::parse("ghost").unwrap())
            .unwrap_err()
            .is_not_exist());
    }

    #[test]
    fn test_drop_removes_dataset_and_tags() {
        let (_dir, driver) = driver();
        let id = image_id();
        driver.create_empty("app", &id).unwrap();
        driver.tag(&id, &Tag::default()).unwrap();
        driver.tag(&id, &Tag::new("v1").unwrap()).unwrap();

        driver.drop_build(&id).unwrap();
        assert!(driver.info(&id).unwrap_err().is_not_exist());
        assert!(driver
            .build_id(&BuildKey::parse("app:v1").unwrap())
            .unwrap_err()
            .is_not_exist());
        assert!(driver.builds().unwrap().is_empty());

        assert!(driver.drop_build(&id).unwrap_err().is_not_exist());
    }
}
