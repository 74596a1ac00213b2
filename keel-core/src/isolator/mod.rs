//! Isolator client: a supervised executor child reached over a unix socket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐    unix socket     ┌──────────────────┐
//! │  build session   │ ──────────────────►│  keel-executor   │
//! │                  │                    │  (chrooted into  │
//! │  send Execute    │◄────────────────── │   the new root)  │
//! │  recv Log*       │   <runtime>/…sock  │  sh -c <command> │
//! │  recv Completed  │                    │                  │
//! └──────────────────┘                    └──────────────────┘
//! ```
//!
//! Each executor gets its own socket under the runtime directory, bound
//! before the child switches roots. The executor takes non-zero time to
//! listen after spawn; connecting goes through the retry primitive with a
//! bounded attempt count.

pub mod wire;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{KeelError, Result};
use crate::paths;
use crate::retry;
use wire::Message;

/// Name of the executor binary, expected next to the current executable.
pub const EXECUTOR_BIN: &str = "keel-executor";

/// A host directory exposed inside the sandbox.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: PathBuf,
    pub writable: bool,
}

/// Launch configuration for one executor.
#[derive(Debug, Clone)]
pub struct IsolatorConfig {
    /// Directory the executor takes as its root.
    pub dir: PathBuf,
    /// Bind mounts applied beneath the root before switching into it.
    pub mounts: Vec<BindMount>,
}

/// Request/response channel to a running executor.
#[async_trait]
pub trait IsolatorChannel: Send {
    async fn send(&mut self, msg: Message) -> Result<()>;
    async fn receive(&mut self) -> Result<Message>;
}

/// Owns the executor child; terminating reaps it.
#[async_trait]
pub trait IsolatorHandle: Send {
    /// Stop the executor and block until it has exited.
    async fn terminate(self: Box<Self>) -> Result<()>;
}

/// A started isolator: the message channel plus the supervision handle.
pub struct RunningIsolator {
    pub channel: Box<dyn IsolatorChannel>,
    pub handle: Box<dyn IsolatorHandle>,
}

/// Starts isolators. Implemented by the executor-process launcher in
/// production and by scripted fakes in tests.
#[async_trait]
pub trait IsolatorLauncher: Send + Sync {
    async fn start(
        &self,
        cancel: &CancellationToken,
        config: IsolatorConfig,
    ) -> Result<RunningIsolator>;
}

/// Spawns the `keel-executor` binary and connects to its socket.
pub struct ExecutorLauncher {
    executor: PathBuf,
}

impl ExecutorLauncher {
    /// Locate the executor binary.
    ///
    /// Resolution order: `KEEL_EXECUTOR` environment variable, a sibling of
    /// the current executable, `$PATH`.
    pub fn new() -> Self {
        if let Ok(path) = std::env::var("KEEL_EXECUTOR") {
            return Self { executor: PathBuf::from(path) };
        }
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| Some(exe.parent()?.join(EXECUTOR_BIN)))
            .filter(|path| path.exists());
        Self { executor: sibling.unwrap_or_else(|| PathBuf::from(EXECUTOR_BIN)) }
    }

    /// Use an explicit executor binary.
    pub fn with_executor(executor: impl Into<PathBuf>) -> Self {
        Self { executor: executor.into() }
    }
}

impl Default for ExecutorLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IsolatorLauncher for ExecutorLauncher {
    async fn start(
        &self,
        cancel: &CancellationToken,
        config: IsolatorConfig,
    ) -> Result<RunningIsolator> {
        let runtime_dir = paths::runtime_dir();
        std::fs::create_dir_all(&runtime_dir).map_err(|e| KeelError::io(&runtime_dir, e))?;
        let socket = runtime_dir.join(format!("executor-{}.sock", Uuid::new_v4().simple()));

        let mut command = Command::new(&self.executor);
        command.arg("--root").arg(&config.dir).arg("--socket").arg(&socket);
        for mount in &config.mounts {
            command.arg("--mount").arg(format!(
                "{}:{}:{}",
                mount.host.display(),
                mount.container.display(),
                if mount.writable { "rw" } else { "ro" },
            ));
        }
        command.kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            KeelError::Internal(format!("spawning executor {}: {e}", self.executor.display()))
        })?;
        debug!(executor = %self.executor.display(), root = %config.dir.display(), "executor spawned");

        let stream = retry::retry(cancel, 10, Duration::from_secs(1), || {
            let socket = socket.clone();
            async move {
                UnixStream::connect(&socket).await.map_err(|e| {
                    retry::retryable(KeelError::Internal(format!(
                        "connecting to executor socket {}: {e}",
                        socket.display()
                    )))
                })
            }
        })
        .await?;
        debug!(socket = %socket.display(), "executor connected");

        Ok(RunningIsolator {
            channel: Box::new(StreamChannel { stream }),
            handle: Box::new(ExecutorHandle { child, socket }),
        })
    }
}

struct StreamChannel {
    stream: UnixStream,
}

#[async_trait]
impl IsolatorChannel for StreamChannel {
    async fn send(&mut self, msg: Message) -> Result<()> {
        wire::send(&mut self.stream, &msg).await
    }

    async fn receive(&mut self) -> Result<Message> {
        wire::recv(&mut self.stream).await
    }
}

struct ExecutorHandle {
    child: Child,
    socket: PathBuf,
}

#[async_trait]
impl IsolatorHandle for ExecutorHandle {
    async fn terminate(mut self: Box<Self>) -> Result<()> {
        // The child normally only exits because we stop it; a child that is
        // already gone is fine.
        let _ = self.child.start_kill();
        self.child
            .wait()
            .await
            .map_err(|e| KeelError::Internal(format!("reaping executor: {e}")))?;
        let _ = std::fs::remove_file(&self.socket);
        Ok(())
    }
}
