//! Per-build command evaluation session.
//!
//! A session owns the manifest under construction, the isolator channel once
//! `FROM` has resolved, and the output proxies that command logs stream to.
//! Evaluation is strictly sequential within one build.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{KeelError, Result};
use crate::isolator::wire::{LogStream, Message};
use crate::isolator::IsolatorChannel;
use crate::types::{BuildId, ImageManifest};

/// Shared output proxy for streamed command logs.
pub type OutputSink = Arc<Mutex<dyn Write + Send>>;

/// Output sinks backed by the process stdout and stderr.
pub fn standard_sinks() -> (OutputSink, OutputSink) {
    (Arc::new(Mutex::new(std::io::stdout())), Arc::new(Mutex::new(std::io::stderr())))
}

pub(crate) struct BuildSession {
    based_on: Option<BuildId>,
    params: Vec<String>,
    from_done: bool,
    isolator: Option<Box<dyn IsolatorChannel>>,
    stdout: OutputSink,
    stderr: OutputSink,
}

impl BuildSession {
    pub(crate) fn new(stdout: OutputSink, stderr: OutputSink) -> Self {
        Self { based_on: None, params: Vec::new(), from_done: false, isolator: None, stdout, stderr }
    }

    /// Guard the at-most-once rule before base resolution starts.
    pub(crate) fn begin_from(&self) -> Result<()> {
        if self.from_done {
            return Err(KeelError::DuplicateFrom);
        }
        Ok(())
    }

    /// Record the resolved parent and the started isolator.
    pub(crate) fn finish_from(
        &mut self,
        parent: &ImageManifest,
        isolator: Box<dyn IsolatorChannel>,
    ) {
        self.based_on = Some(parent.build_id.clone());
        self.params = parent.params.clone();
        self.isolator = Some(isolator);
        self.from_done = true;
    }

    /// Append kernel parameters. Order is the user's; duplicates stay.
    pub(crate) fn params(&mut self, params: &[String]) -> Result<()> {
        if !self.from_done {
            return Err(KeelError::MissingFrom { directive: "PARAMS".to_string() });
        }
        self.params.extend_from_slice(params);
        Ok(())
    }

    /// Execute one command inside the isolator, streaming its logs.
    pub(crate) async fn run(&mut self, cancel: &CancellationToken, command: &str) -> Result<()> {
        if !self.from_done {
            return Err(KeelError::MissingFrom { directive: "RUN".to_string() });
        }
        let isolator = self
            .isolator
            .as_mut()
            .ok_or_else(|| KeelError::Internal("isolator not started".to_string()))?;

        debug!(command, "executing");
        isolator.send(Message::Execute { command: command.to_string() }).await?;

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Err(KeelError::Canceled),
                msg = isolator.receive() => msg?,
            };
            match msg {
                Message::Log { stream, text } => {
                    let sink = match stream {
                        LogStream::Out => &self.stdout,
                        LogStream::Err => &self.stderr,
                    };
                    write_line(sink, &text)?;
                }
                Message::Completed { exit_code, error } => {
                    if exit_code == 0 && error.is_empty() {
                        return Ok(());
                    }
                    return Err(KeelError::CommandFailed {
                        command: command.to_string(),
                        exit_code,
                        error,
                    });
                }
                other => {
                    return Err(KeelError::Protocol {
                        reason: format!("unexpected message from executor: {other:?}"),
                    })
                }
            }
        }
    }

    /// Seal the session into the manifest for `build_id`.
    pub(crate) fn into_manifest(self, build_id: BuildId) -> ImageManifest {
        ImageManifest { build_id, based_on: self.based_on, params: self.params }
    }
}

/// Logs are flushed line by line so everything a command emitted is visible
/// before its completion is surfaced.
fn write_line(sink: &OutputSink, text: &str) -> Result<()> {
    let mut sink = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    writeln!(sink, "{text}")
        .and_then(|()| sink.flush())
        .map_err(|e| KeelError::Internal(format!("writing build output: {e}")))
}
