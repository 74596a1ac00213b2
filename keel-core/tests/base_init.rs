//! Base-image initialization runs inside the switched root.
//!
//! This lives in its own test binary because `chroot(2)` changes the root of
//! the whole process. The test skips itself when not running as root.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use keel_core::base::Initializer;
use keel_core::builder::{BuildConfig, Builder};
use keel_core::error::{KeelError, Result};
use keel_core::isolator::{IsolatorConfig, IsolatorLauncher, RunningIsolator};
use keel_core::repository::Repository;
use keel_core::spec::describe;
use keel_core::storage::{Driver, UnmountFn};
use keel_core::types::{BuildId, BuildInfo, BuildKey, ImageManifest, Tag};

#[derive(Default)]
struct State {
    datasets: HashMap<BuildId, (String, Option<ImageManifest>)>,
    tags: HashMap<BuildKey, BuildId>,
}

/// Just enough driver for a base-image build; mounting is a no-op so the
/// scratch directory doubles as the mounted root.
#[derive(Default, Clone)]
struct BaseDriver {
    state: Arc<Mutex<State>>,
}

impl Driver for BaseDriver {
    fn create_empty(&self, name: &str, new_id: &BuildId) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .datasets
            .insert(new_id.clone(), (name.to_string(), None));
        Ok(())
    }

    fn clone_build(&self, _src_id: &BuildId, _name: &str, _new_id: &BuildId) -> Result<()> {
        unimplemented!("not exercised by a base build")
    }

    fn mount(&self, _id: &BuildId, _path: &Path) -> Result<UnmountFn> {
        Ok(Box::new(|| Ok(())))
    }

    fn manifest(&self, _id: &BuildId) -> Result<ImageManifest> {
        unimplemented!("not exercised by a base build")
    }

    fn store_manifest(&self, manifest: &ImageManifest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let dataset = state
            .datasets
            .get_mut(&manifest.build_id)
            .ok_or_else(|| KeelError::ImageDoesNotExist { what: manifest.build_id.to_string() })?;
        dataset.1 = Some(manifest.clone());
        Ok(())
    }

    fn build_id(&self, key: &BuildKey) -> Result<BuildId> {
        self.state
            .lock()
            .unwrap()
            .tags
            .get(key)
            .cloned()
            .ok_or_else(|| KeelError::ImageDoesNotExist { what: key.to_string() })
    }

    fn tag(&self, id: &BuildId, tag: &Tag) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = state.datasets[id].0.clone();
        state.tags.insert(BuildKey::new(name, tag.clone()), id.clone());
        Ok(())
    }

    fn drop_build(&self, id: &BuildId) -> Result<()> {
        self.state.lock().unwrap().datasets.remove(id);
        Ok(())
    }

    fn builds(&self) -> Result<Vec<BuildId>> {
        Ok(self.state.lock().unwrap().datasets.keys().cloned().collect())
    }

    fn info(&self, id: &BuildId) -> Result<BuildInfo> {
        let state = self.state.lock().unwrap();
        let (name, manifest) = state
            .datasets
            .get(id)
            .ok_or_else(|| KeelError::ImageDoesNotExist { what: id.to_string() })?;
        Ok(BuildInfo {
            build_id: id.clone(),
            based_on: manifest.as_ref().and_then(|m| m.based_on.clone()),
            name: name.clone(),
            tags: Vec::new(),
            created_at: SystemTime::now(),
            mounted: None,
            params: Vec::new(),
        })
    }
}

struct NoIsolator;

#[async_trait]
impl IsolatorLauncher for NoIsolator {
    async fn start(
        &self,
        _cancel: &CancellationToken,
        _config: IsolatorConfig,
    ) -> Result<RunningIsolator> {
        unimplemented!("not exercised by a base build")
    }
}

/// Records the key it was invoked for and what the root looked like.
#[derive(Default)]
struct ProbingInitializer {
    calls: Arc<AtomicUsize>,
    root_entries: Arc<AtomicUsize>,
}

#[async_trait]
impl Initializer for ProbingInitializer {
    async fn init(&self, _key: &BuildKey) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let entries = std::fs::read_dir("/")
            .map_err(|e| KeelError::io("/", e))?
            .count();
        self.root_entries.store(entries, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_initializer_runs_inside_new_root() {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("skipping: requires root for chroot");
        return;
    }

    let driver = BaseDriver::default();
    let initializer = ProbingInitializer::default();
    let calls = initializer.calls.clone();
    let root_entries = initializer.root_entries.clone();
    let scratch_root = TempDir::new().unwrap();

    let config = BuildConfig {
        rebuild: false,
        spec_dir: std::env::temp_dir(),
        scratch_dir: scratch_root.path().to_path_buf(),
    };
    let mut builder = Builder::new(
        config,
        Arc::new(initializer),
        Repository::new(),
        Arc::new(driver.clone()),
        Arc::new(NoIsolator),
    );

    let cancel = CancellationToken::new();
    let id = builder
        .build(&cancel, &describe("alpine", Vec::new(), Vec::new()))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1, "initializer runs once");
    // The view from inside the switched root is the empty scratch mount,
    // not the host filesystem.
    assert_eq!(root_entries.load(Ordering::SeqCst), 0);
    // And the original root is restored afterwards.
    assert!(Path::new("/proc/mounts").exists());

    assert_eq!(
        driver.build_id(&BuildKey::parse("alpine").unwrap()).unwrap(),
        id
    );
    assert_eq!(
        std::fs::read_dir(scratch_root.path()).unwrap().count(),
        0,
        "scratch directory reaped"
    );
}
