//! User-facing operations over the storage driver and the build engine.
//!
//! These are the entry points the CLI wires up: building spec files,
//! enumerating builds, dropping them in dependency order, and creating
//! long-lived mounts of stored images.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::builder::Builder;
use crate::error::{KeelError, Result};
use crate::storage::Driver;
use crate::types::{
    is_name_valid, BuildId, BuildInfo, BuildKey, BuildType, ImageManifest, Tag,
};

/// One spec file to build.
#[derive(Debug, Clone)]
pub struct SpecRequest {
    pub spec_file: PathBuf,
    pub name: String,
    pub tags: Vec<Tag>,
}

/// Build each requested spec file and report the resulting builds.
pub async fn build(
    cancel: &CancellationToken,
    builder: &mut Builder,
    storage: &dyn Driver,
    requests: &[SpecRequest],
) -> Result<Vec<BuildInfo>> {
    let mut infos = Vec::with_capacity(requests.len());
    for request in requests {
        let build_id = builder
            .build_from_file(cancel, &request.spec_file, &request.name, &request.tags)
            .await?;
        infos.push(storage.info(&build_id)?);
    }
    Ok(infos)
}

/// Build-key pattern used by filters. A missing name matches any name and a
/// missing tag matches any tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    pub name: Option<String>,
    pub tag: Option<Tag>,
}

impl KeyPattern {
    /// Parse `name`, `name:tag` or `:tag`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || KeelError::InvalidBuildKey { value: s.to_string() };
        let (name, tag) = match s.split_once(':') {
            Some((name, tag)) => (name, Some(tag)),
            None => (s, None),
        };
        let name = match name {
            "" => None,
            name if is_name_valid(name) => Some(name.to_string()),
            _ => return Err(invalid()),
        };
        let tag = match tag {
            None => None,
            Some(tag) => Some(Tag::new(tag).map_err(|_| invalid())?),
        };
        if name.is_none() && tag.is_none() {
            return Err(invalid());
        }
        Ok(Self { name, tag })
    }

    fn matches(&self, info: &BuildInfo) -> bool {
        if let Some(name) = &self.name {
            if *name != info.name {
                return false;
            }
        }
        match &self.tag {
            None => true,
            Some(tag) => info.tags.contains(tag),
        }
    }
}

/// Build selection for `list` and `drop_builds`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub build_ids: Vec<BuildId>,
    pub keys: Vec<KeyPattern>,
    /// Restrict to these types; empty means all types.
    pub types: Vec<BuildType>,
    /// Keep only builds with no tags.
    pub untagged: bool,
}

impl Filter {
    fn has_selectors(&self) -> bool {
        !self.build_ids.is_empty() || !self.keys.is_empty()
    }

    fn matches(&self, info: &BuildInfo) -> bool {
        if !self.types.is_empty() && !self.types.contains(&info.build_id.build_type()) {
            return false;
        }
        if self.untagged && !info.tags.is_empty() {
            return false;
        }
        if !self.has_selectors() {
            return true;
        }
        self.build_ids.contains(&info.build_id) || self.keys.iter().any(|k| k.matches(info))
    }
}

/// Enumerate builds matching the filter.
pub fn list(storage: &dyn Driver, filter: &Filter) -> Result<Vec<BuildInfo>> {
    let mut infos = Vec::new();
    for id in storage.builds()? {
        let info = storage.info(&id)?;
        if filter.matches(&info) {
            infos.push(info);
        }
    }
    Ok(infos)
}

/// Outcome of dropping one build.
#[derive(Debug)]
pub struct DropResult {
    pub build_id: BuildId,
    pub error: Option<KeelError>,
}

/// Drop the selected builds, children before parents.
///
/// Walks each selection's `based_on` chain into a child-to-parent map, orders
/// the selection parent-first by DFS and then deletes in reverse, so no build
/// goes before its selected descendants. A failed drop does not abort the
/// sequence; per-build errors are reported in the results.
#[instrument(skip_all)]
pub fn drop_builds(storage: &dyn Driver, filter: &Filter, all: bool) -> Result<Vec<DropResult>> {
    if !all && !filter.has_selectors() {
        return Err(KeelError::NoSelector);
    }

    let selected = list(storage, filter)?;
    if selected.is_empty() {
        return Err(KeelError::NothingSelected);
    }
    let to_delete: HashSet<BuildId> = selected.iter().map(|info| info.build_id.clone()).collect();

    // child -> parent over every chain reachable from the selection. A
    // parent that no longer exists terminates its chain as a tombstone.
    let mut parent: HashMap<BuildId, Option<BuildId>> = HashMap::new();
    for info in &selected {
        let mut id = info.build_id.clone();
        let mut based_on = info.based_on.clone();
        loop {
            if parent.contains_key(&id) {
                break;
            }
            parent.insert(id.clone(), based_on.clone());
            let Some(next) = based_on else { break };
            match storage.info(&next) {
                Ok(next_info) => {
                    id = next;
                    based_on = next_info.based_on;
                }
                Err(err) if err.is_not_exist() => break,
                Err(err) => return Err(err),
            }
        }
    }

    let mut visited = HashSet::new();
    let mut sequence = Vec::new();
    for info in &selected {
        visit(&info.build_id, &parent, &to_delete, &mut visited, &mut sequence);
    }

    let mut results = Vec::with_capacity(sequence.len());
    for id in sequence.iter().rev() {
        let error = storage.drop_build(id).err();
        match &error {
            None => debug!(build_id = %id, "dropped"),
            Some(err) => warn!(build_id = %id, error = %err, "drop failed"),
        }
        results.push(DropResult { build_id: id.clone(), error });
    }
    Ok(results)
}

/// Parent-first DFS; appends a node iff it is selected for deletion.
fn visit(
    id: &BuildId,
    parent: &HashMap<BuildId, Option<BuildId>>,
    to_delete: &HashSet<BuildId>,
    visited: &mut HashSet<BuildId>,
    sequence: &mut Vec<BuildId>,
) {
    if !visited.insert(id.clone()) {
        return;
    }
    if let Some(Some(base)) = parent.get(id) {
        visit(base, parent, to_delete, visited, sequence);
    }
    if to_delete.contains(id) {
        sequence.push(id.clone());
    }
}

/// Request for a long-lived mount of a stored image.
#[derive(Debug, Clone)]
pub struct MountRequest {
    /// Image selected by ID, or by key when absent.
    pub build_id: Option<BuildId>,
    pub key: Option<BuildKey>,
    /// Name and tag for the mounted clone. Name defaults to the image name,
    /// tag to a random one.
    pub target: Option<KeyPattern>,
    /// `Mount` or `Boot`.
    pub build_type: BuildType,
}

/// Clone an image into a mountable instance, seal and tag it, and mount it
/// under `mounts_dir`.
#[instrument(skip_all, fields(build_type = %request.build_type))]
pub fn mount_build(
    storage: &dyn Driver,
    request: &MountRequest,
    mounts_dir: &Path,
) -> Result<BuildInfo> {
    if !request.build_type.properties().mountable {
        return Err(KeelError::NotMountable { build_type: request.build_type.to_string() });
    }

    let image_id = match &request.build_id {
        Some(id) => id.clone(),
        None => {
            let key = request.key.as_ref().ok_or_else(|| {
                KeelError::Internal("mount requires a build ID or a build key".to_string())
            })?;
            storage.build_id(key)?
        }
    };
    if !image_id.build_type().properties().cloneable {
        return Err(KeelError::SourceNotCloneable { id: image_id.to_string() });
    }
    let image = storage.info(&image_id)?;

    let (name, tag) = match &request.target {
        Some(target) => (
            target.name.clone().unwrap_or_else(|| image.name.clone()),
            target.tag.clone().unwrap_or_else(Tag::random),
        ),
        None => (image.name.clone(), Tag::random()),
    };

    let new_id = BuildId::generate(request.build_type);
    storage.clone_build(&image_id, &name, &new_id)?;
    storage.store_manifest(&ImageManifest {
        build_id: new_id.clone(),
        based_on: Some(image_id),
        params: image.params.clone(),
    })?;
    storage.tag(&new_id, &tag)?;

    let mountpoint = mounts_dir.join(new_id.to_string());
    fs::create_dir_all(&mountpoint).map_err(|e| KeelError::io(&mountpoint, e))?;
    // The handle is dropped deliberately: the mount outlives this call and
    // is reaped when the build is dropped.
    let _unmount = storage.mount(&new_id, &mountpoint)?;

    storage.info(&new_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pattern_parse() {
        let p = KeyPattern::parse("app").unwrap();
        assert_eq!(p.name.as_deref(), Some("app"));
        assert!(p.tag.is_none());

        let p = KeyPattern::parse("app:v1").unwrap();
        assert_eq!(p.name.as_deref(), Some("app"));
        assert_eq!(p.tag.as_ref().map(Tag::as_str), Some("v1"));

        let p = KeyPattern::parse(":v1").unwrap();
        assert!(p.name.is_none());
        assert_eq!(p.tag.as_ref().map(Tag::as_str), Some("v1"));

        assert!(KeyPattern::parse("").is_err());
        assert!(KeyPattern::parse(":").is_err());
        assert!(KeyPattern::parse("bad name").is_err());
    }
}
