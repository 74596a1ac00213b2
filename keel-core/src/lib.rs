//! Keel Core Library
//!
//! Builds, stores, mounts and lifecycle-manages root-filesystem images for
//! Linux virtual machines and containers.

pub mod base;
pub mod builder;
pub mod chroot;
pub mod error;
pub mod isolator;
pub mod mounts;
pub mod ops;
pub mod paths;
pub mod repository;
pub mod retry;
pub mod spec;
pub mod storage;
pub mod types;

// Re-export commonly used items
pub use builder::{BuildConfig, Builder};
pub use error::{KeelError, Result};
pub use repository::Repository;
pub use storage::{DirDriver, Driver};
pub use types::{BuildId, BuildInfo, BuildKey, BuildType, ImageManifest, Tag};
