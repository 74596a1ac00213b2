//! Base-image initialization callback.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::BuildKey;

/// Populates the image root for a well-known base.
///
/// Invoked with the process root already switched to the build's working
/// filesystem, so the implementation installs into `/root`. The name
/// `scratch` never reaches an initializer; it always stays empty.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn init(&self, key: &BuildKey) -> Result<()>;
}

/// Initializer that provisions nothing. Distribution bootstrap hooks in by
/// replacing this.
pub struct NoopInitializer;

#[async_trait]
impl Initializer for NoopInitializer {
    async fn init(&self, _key: &BuildKey) -> Result<()> {
        Ok(())
    }
}
