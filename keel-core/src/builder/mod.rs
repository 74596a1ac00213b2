//! The build engine.
//!
//! One [`Builder`] evaluates descriptors into stored images. A build
//! validates its keys against the resolution stack (cycle detection),
//! allocates a fresh build ID and a scratch directory, then takes one of two
//! paths: a descriptor with no commands is a base image (created empty and
//! populated by the initializer inside a scoped root switch), anything else
//! is a derivative (its `FROM` clones the resolved base, mounts the clone at
//! the scratch path and starts the isolator for subsequent `RUN`s).
//!
//! Whatever happens, a deferred cleanup tears down the isolator, every mount
//! beneath the scratch path, the scratch directory itself and, on failure,
//! the half-built dataset. Cleanup errors never mask the error that caused
//! the unwind.

mod session;

pub use session::{standard_sinks, OutputSink};

use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::base::Initializer;
use crate::chroot;
use crate::error::{KeelError, Result};
use crate::isolator::{BindMount, IsolatorChannel, IsolatorConfig, IsolatorHandle, IsolatorLauncher};
use crate::mounts;
use crate::repository::Repository;
use crate::spec::{describe, parser, Command, Descriptor};
use crate::storage::{Driver, UnmountFn};
use crate::types::{
    is_name_valid, BuildId, BuildKey, BuildType, ImageManifest, Tag, SCRATCH_NAME,
};

use session::BuildSession;

/// Name of the spec-directory bind inside the scratch path.
const SPEC_DIR: &str = ".specdir";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Rebuild base images even when a stored image satisfies the key.
    /// Each key is still rebuilt at most once per top-level build.
    pub rebuild: bool,
    /// Directory spec files are resolved against.
    pub spec_dir: PathBuf,
    /// Directory per-build scratch directories are allocated under.
    pub scratch_dir: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            rebuild: false,
            spec_dir: PathBuf::from("."),
            scratch_dir: std::env::temp_dir(),
        }
    }
}

/// Builds images.
///
/// A single instance is not safe for concurrent top-level builds; the
/// session cache and the resolution stack assume one build at a time.
pub struct Builder {
    rebuild: bool,
    spec_dir: PathBuf,
    scratch_dir: PathBuf,
    ready_builds: HashSet<BuildKey>,

    initializer: Arc<dyn Initializer>,
    repo: Repository,
    storage: Arc<dyn Driver>,
    launcher: Arc<dyn IsolatorLauncher>,

    stdout: OutputSink,
    stderr: OutputSink,
}

impl Builder {
    pub fn new(
        config: BuildConfig,
        initializer: Arc<dyn Initializer>,
        repo: Repository,
        storage: Arc<dyn Driver>,
        launcher: Arc<dyn IsolatorLauncher>,
    ) -> Self {
        let (stdout, stderr) = standard_sinks();
        Self {
            rebuild: config.rebuild,
            spec_dir: config.spec_dir,
            scratch_dir: config.scratch_dir,
            ready_builds: HashSet::new(),
            initializer,
            repo,
            storage,
            launcher,
            stdout,
            stderr,
        }
    }

    /// Redirect streamed command output, e.g. into a capture buffer.
    pub fn with_output(mut self, stdout: OutputSink, stderr: OutputSink) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Build one descriptor.
    #[instrument(skip_all, fields(name = %img.name()))]
    pub async fn build(
        &mut self,
        cancel: &CancellationToken,
        img: &Descriptor,
    ) -> Result<BuildId> {
        let mut stack = HashSet::new();
        self.build_with_stack(cancel, &mut stack, img).await
    }

    /// Build from a spec file. Sibling spec files referenced by `FROM`
    /// resolve against the file's directory.
    #[instrument(skip_all, fields(spec = %spec_file.display(), name = %name))]
    pub async fn build_from_file(
        &mut self,
        cancel: &CancellationToken,
        spec_file: &Path,
        name: &str,
        tags: &[Tag],
    ) -> Result<BuildId> {
        if let Some(parent) = spec_file.parent() {
            if !parent.as_os_str().is_empty() {
                self.spec_dir = parent.to_path_buf();
            }
        }
        let mut stack = HashSet::new();
        self.build_file_with_stack(cancel, &mut stack, spec_file, name, tags).await
    }

    async fn build_file_with_stack(
        &mut self,
        cancel: &CancellationToken,
        stack: &mut HashSet<BuildKey>,
        spec_file: &Path,
        name: &str,
        tags: &[Tag],
    ) -> Result<BuildId> {
        let commands = parser::parse_file(spec_file)?;
        let img = describe(name, tags.to_vec(), commands);
        self.build_with_stack(cancel, stack, &img).await
    }

    /// Recursion point for `FROM` resolution; boxed so the future type
    /// stays finite.
    fn build_with_stack<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        stack: &'a mut HashSet<BuildKey>,
        img: &'a Descriptor,
    ) -> Pin<Box<dyn Future<Output = Result<BuildId>> + Send + 'a>> {
        Box::pin(async move {
            if !is_name_valid(img.name()) {
                return Err(KeelError::InvalidName { name: img.name().to_string() });
            }
            let tags: Vec<Tag> =
                if img.tags().is_empty() { vec![Tag::default()] } else { img.tags().to_vec() };

            // Entries stay on the stack for the whole top-level build: any
            // re-entry on a key that was ever in progress is a cycle.
            let mut keys = Vec::with_capacity(tags.len());
            for tag in &tags {
                let key = BuildKey::new(img.name(), tag.clone());
                if !stack.insert(key.clone()) {
                    return Err(KeelError::Cycle { key: key.to_string() });
                }
                keys.push(key);
            }

            let build_id = BuildId::generate(BuildType::Image);
            let scratch = self.scratch_dir.join(format!("keel-build-{}", Uuid::new_v4().simple()));
            fs::create_dir_all(&scratch).map_err(|e| KeelError::io(&scratch, e))?;
            info!(build_id = %build_id, scratch = %scratch.display(), "starting build");

            let mut cleanup = Cleanup::new(scratch.clone());
            let result =
                self.build_phase(cancel, stack, img, &keys, &build_id, &scratch, &mut cleanup).await;
            cleanup.finish(result, self.storage.as_ref(), &build_id).await?;

            info!(build_id = %build_id, "build finished");
            Ok(build_id)
        })
    }

    async fn build_phase(
        &mut self,
        cancel: &CancellationToken,
        stack: &mut HashSet<BuildKey>,
        img: &Descriptor,
        keys: &[BuildKey],
        build_id: &BuildId,
        scratch: &Path,
        cleanup: &mut Cleanup,
    ) -> Result<()> {
        if img.commands().is_empty() {
            // Base image.
            if keys.len() != 1 {
                return Err(KeelError::BaseTagCount { count: keys.len() });
            }
            self.storage.create_empty(img.name(), build_id)?;
            cleanup.unmount = Some(self.storage.mount(build_id, scratch)?);
            self.initialize(&keys[0], scratch).await?;
            self.storage.store_manifest(&ImageManifest {
                build_id: build_id.clone(),
                based_on: None,
                params: Vec::new(),
            })?;
        } else {
            let mut session = BuildSession::new(self.stdout.clone(), self.stderr.clone());
            for command in img.commands() {
                if cancel.is_cancelled() {
                    return Err(KeelError::Canceled);
                }
                match command {
                    Command::From(src) => {
                        session.begin_from()?;
                        let (parent, channel) = self
                            .resolve_base(cancel, stack, img.name(), build_id, scratch, cleanup, src)
                            .await?;
                        session.finish_from(&parent, channel);
                    }
                    Command::Params(params) => session.params(params)?,
                    Command::Run(command) => session.run(cancel, command).await?,
                }
            }
            self.storage.store_manifest(&session.into_manifest(build_id.clone()))?;
        }

        for key in keys {
            self.storage.tag(build_id, &key.tag)?;
        }
        for key in keys {
            self.ready_builds.insert(key.clone());
        }
        Ok(())
    }

    /// Run the base-image initializer inside a scoped root switch at the
    /// mounted scratch path.
    async fn initialize(&self, key: &BuildKey, path: &Path) -> Result<()> {
        if key.name == SCRATCH_NAME {
            return Ok(());
        }
        debug!(key = %key, "initializing base image");
        let guard = chroot::enter(path)?;
        let result = self.initializer.init(key).await;
        let restored = guard.exit();
        result.and(restored)
    }

    /// Resolve the base for a `FROM`, clone it under this build's identity,
    /// mount the clone and start the isolator over it.
    ///
    /// Resolution order: the stored image (unless a rebuild is forced and the
    /// key was not already built this session), a sibling spec file (default
    /// tag only), the repository, and finally a bare base descriptor the
    /// initializer may know.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_base(
        &mut self,
        cancel: &CancellationToken,
        stack: &mut HashSet<BuildKey>,
        name: &str,
        build_id: &BuildId,
        scratch: &Path,
        cleanup: &mut Cleanup,
        src: &BuildKey,
    ) -> Result<(ImageManifest, Box<dyn IsolatorChannel>)> {
        if !is_name_valid(&src.name) {
            return Err(KeelError::InvalidName { name: src.name.clone() });
        }

        let mut src_id = None;
        if !self.rebuild || self.ready_builds.contains(src) {
            match self.storage.build_id(src) {
                Ok(id) => src_id = Some(id),
                Err(err) if err.is_not_exist() => {}
                Err(err) => return Err(err),
            }
        }

        if src_id.is_none() {
            let mut resolved = false;
            if src.tag == Tag::default() {
                // A spec file named after the image, next to the current one.
                let spec_file = self.spec_dir.join(&src.name);
                if spec_file.is_file() {
                    debug!(spec = %spec_file.display(), "building base from spec file");
                    self.build_file_with_stack(
                        cancel,
                        stack,
                        &spec_file,
                        &src.name,
                        std::slice::from_ref(&src.tag),
                    )
                    .await?;
                    resolved = true;
                }
            }
            if !resolved {
                let img = self.repo.retrieve(src).cloned().unwrap_or_else(|| {
                    describe(src.name.clone(), vec![src.tag.clone()], Vec::new())
                });
                debug!(key = %src, "building base from descriptor");
                self.build_with_stack(cancel, stack, &img).await?;
            }
        }

        let src_id = match src_id {
            Some(id) => id,
            None => self.storage.build_id(src)?,
        };

        self.storage.clone_build(&src_id, name, build_id)?;
        cleanup.unmount = Some(self.storage.mount(build_id, scratch)?);
        let parent = self.storage.manifest(&src_id)?;

        // The spec directory rides along read-only so RUN commands can
        // reference files adjacent to the spec.
        let running = self
            .launcher
            .start(
                cancel,
                IsolatorConfig {
                    dir: scratch.to_path_buf(),
                    mounts: vec![BindMount {
                        host: self.spec_dir.clone(),
                        container: PathBuf::from("/").join(SPEC_DIR),
                        writable: false,
                    }],
                },
            )
            .await?;
        cleanup.isolator = Some(running.handle);

        Ok((parent, running.channel))
    }
}

/// Deferred teardown for one build, run on every exit path.
struct Cleanup {
    scratch: PathBuf,
    unmount: Option<UnmountFn>,
    isolator: Option<Box<dyn IsolatorHandle>>,
}

impl Cleanup {
    fn new(scratch: PathBuf) -> Self {
        Self { scratch, unmount: None, isolator: None }
    }

    /// Tear down in order: isolator, mounts beneath the scratch path, the
    /// spec-dir helper, the image mount, the scratch directory, and on
    /// failure the dataset itself. The first error wins.
    async fn finish(
        mut self,
        result: Result<()>,
        storage: &dyn Driver,
        build_id: &BuildId,
    ) -> Result<()> {
        let mut first = result.err();

        if let Some(handle) = self.isolator.take() {
            if let Err(err) = handle.terminate().await {
                coalesce(&mut first, err);
            }
        }

        if let Err(err) = mounts::unmount_tree(&self.scratch) {
            coalesce(&mut first, err);
        }

        let spec_dir = self.scratch.join(SPEC_DIR);
        if let Err(err) = fs::remove_dir(&spec_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                coalesce(&mut first, KeelError::io(&spec_dir, err));
            }
        }

        if let Some(unmount) = self.unmount.take() {
            if let Err(err) = unmount() {
                coalesce(&mut first, err);
            }
        }

        if let Err(err) = fs::remove_dir(&self.scratch) {
            if err.kind() != std::io::ErrorKind::NotFound {
                coalesce(&mut first, KeelError::io(&self.scratch, err));
            }
        }

        if first.is_some() {
            match storage.drop_build(build_id) {
                Ok(()) => debug!(build_id = %build_id, "dropped failed build"),
                Err(err) if err.is_not_exist() => {}
                Err(err) => warn!(build_id = %build_id, error = %err, "failed to drop failed build"),
            }
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn coalesce(first: &mut Option<KeelError>, err: KeelError) {
    if first.is_none() {
        *first = Some(err);
    } else {
        warn!(error = %err, "additional cleanup failure");
    }
}
