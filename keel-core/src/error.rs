//! Error types for keel.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. The variants form a closed taxonomy: callers match on them to
//! decide whether a failure is recoverable (a missing image triggers the
//! build fallbacks) or terminal.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for keel operations.
pub type Result<T> = std::result::Result<T, KeelError>;

/// Main error type for keel.
#[derive(Error, Debug)]
pub enum KeelError {
    // Identifier validation
    #[error("invalid build ID: {value}")]
    InvalidBuildId { value: String },

    #[error("invalid build key: {value}")]
    InvalidBuildKey { value: String },

    #[error("invalid image name: {name}")]
    InvalidName { name: String },

    #[error("invalid tag: {tag}")]
    InvalidTag { tag: String },

    // Storage
    #[error("image does not exist: {what}")]
    ImageDoesNotExist { what: String },

    #[error("build already exists: {id}")]
    BuildExists { id: String },

    #[error("build {id} is not cloneable")]
    SourceNotCloneable { id: String },

    #[error("build type {build_type} is not mountable")]
    NotMountable { build_type: String },

    // Build engine
    #[error("dependency loop detected on image {key}")]
    Cycle { key: String },

    #[error("exactly one tag is required for a base image, got {count}")]
    BaseTagCount { count: usize },

    #[error("FROM may appear only once per spec")]
    DuplicateFrom,

    #[error("{directive} requires a completed FROM")]
    MissingFrom { directive: String },

    #[error("command {command:?} failed with exit code {exit_code}: {error}")]
    CommandFailed { command: String, exit_code: i32, error: String },

    #[error("isolator protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("operation canceled")]
    Canceled,

    // Drop planner
    #[error("neither filters are provided nor --all is set")]
    NoSelector,

    #[error("no builds were selected to delete")]
    NothingSelected,

    // Spec files
    #[error("parse error at {}:{}: {}", .path.display(), .line, .message)]
    Parse { path: PathBuf, line: usize, message: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KeelError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// True for storage lookup misses, which the build engine recovers from
    /// at its fallback points.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Self::ImageDoesNotExist { .. })
    }
}
