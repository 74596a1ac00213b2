//! Storage driver contract for build datasets.
//!
//! A driver owns one dataset per build plus the tag index that resolves
//! build keys to build IDs. The interface is intentionally narrow so
//! alternative backings (a snapshotting filesystem, a directory tree) stay
//! interchangeable.

pub mod dir;

pub use dir::DirDriver;

use std::path::Path;

use crate::error::Result;
use crate::types::{BuildId, BuildInfo, BuildKey, ImageManifest, Tag};

/// One-shot unmount handle returned by [`Driver::mount`].
///
/// Owned by exactly one build session and invoked exactly once on the
/// nominal path; implementations tolerate an already-gone mountpoint.
pub type UnmountFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Lifecycle operations over build datasets.
pub trait Driver: Send + Sync {
    /// Allocate an empty dataset bound to `new_id`.
    ///
    /// Fails with `BuildExists` if `new_id` is already taken.
    fn create_empty(&self, name: &str, new_id: &BuildId) -> Result<()>;

    /// Snapshot `src_id` as a new dataset bound to `new_id`.
    ///
    /// Fails with `ImageDoesNotExist` for an unknown source and
    /// `SourceNotCloneable` when the source type cannot be cloned.
    fn clone_build(&self, src_id: &BuildId, name: &str, new_id: &BuildId) -> Result<()>;

    /// Mount the dataset writable at `path` and return the unmount handle.
    fn mount(&self, id: &BuildId, path: &Path) -> Result<UnmountFn>;

    /// Read the sealed manifest of a build.
    fn manifest(&self, id: &BuildId) -> Result<ImageManifest>;

    /// Seal a build by persisting its manifest.
    fn store_manifest(&self, manifest: &ImageManifest) -> Result<()>;

    /// Resolve a build key through the tag index.
    fn build_id(&self, key: &BuildKey) -> Result<BuildId>;

    /// Atomically point `tag` at `id`, moving it off any prior holder.
    fn tag(&self, id: &BuildId, tag: &Tag) -> Result<()>;

    /// Remove the dataset, its manifest and every tag pointing at it.
    fn drop_build(&self, id: &BuildId) -> Result<()>;

    /// Enumerate all builds.
    fn builds(&self) -> Result<Vec<BuildId>>;

    /// Denormalized view of one build.
    fn info(&self, id: &BuildId) -> Result<BuildInfo>;
}
