//! Build identity and image metadata types.
//!
//! A build is addressed two ways: by its opaque [`BuildId`], assigned when
//! the build starts and carrying the [`BuildType`], and by a human-readable
//! [`BuildKey`] of `(name, tag)` resolved through the storage driver's tag
//! index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::{KeelError, Result};

/// The tag assigned when none is given.
pub const DEFAULT_TAG: &str = "latest";

/// Reserved base-image name that skips initialization entirely.
pub const SCRATCH_NAME: &str = "scratch";

/// Kind of build a [`BuildId`] identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildType {
    /// A stored image. Cloneable; mounted only transiently while being built.
    Image,
    /// A mounted instance derived from an image.
    Mount,
    /// A mounted instance used to boot a VM.
    Boot,
}

/// Static capabilities of a [`BuildType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeProperties {
    /// The build may be used as a clone source.
    pub cloneable: bool,
    /// The build may be mounted for use outside a build session.
    pub mountable: bool,
    /// The build backs a virtual machine.
    pub vm: bool,
}

impl BuildType {
    /// Capabilities of this type. Fixed at creation of the build.
    #[must_use]
    pub fn properties(&self) -> TypeProperties {
        match self {
            Self::Image => TypeProperties { cloneable: true, mountable: false, vm: false },
            Self::Mount => TypeProperties { cloneable: false, mountable: true, vm: false },
            Self::Boot => TypeProperties { cloneable: false, mountable: true, vm: true },
        }
    }

    /// Build-ID prefix encoding this type.
    fn prefix(&self) -> &'static str {
        match self {
            Self::Image => "img",
            Self::Mount => "mnt",
            Self::Boot => "boot",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "img" => Some(Self::Image),
            "mnt" => Some(Self::Mount),
            "boot" => Some(Self::Boot),
            _ => None,
        }
    }

    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Mount => "mount",
            Self::Boot => "boot",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "image" => Some(Self::Image),
            "mount" => Some(Self::Mount),
            "boot" => Some(Self::Boot),
            _ => None,
        }
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque, globally unique build identifier.
///
/// Rendered as `<prefix>-<32 hex>` where the prefix encodes the
/// [`BuildType`]. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BuildId {
    build_type: BuildType,
    suffix: String,
}

impl BuildId {
    /// Allocate a fresh identifier of the given type.
    pub fn generate(build_type: BuildType) -> Self {
        Self { build_type, suffix: Uuid::new_v4().simple().to_string() }
    }

    /// Parse an identifier from its string form.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || KeelError::InvalidBuildId { value: s.to_string() };
        let (prefix, suffix) = s.split_once('-').ok_or_else(invalid)?;
        let build_type = BuildType::from_prefix(prefix).ok_or_else(invalid)?;
        if suffix.len() != 32 || !suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        Ok(Self { build_type, suffix: suffix.to_ascii_lowercase() })
    }

    /// The type embedded in this identifier.
    #[must_use]
    pub fn build_type(&self) -> BuildType {
        self.build_type
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.build_type.prefix(), self.suffix)
    }
}

impl TryFrom<String> for BuildId {
    type Error = KeelError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BuildId> for String {
    fn from(id: BuildId) -> Self {
        id.to_string()
    }
}

/// True if `name` is usable as an image name.
#[must_use]
pub fn is_name_valid(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// A validated image tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    /// Validate and construct a tag.
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if is_name_valid(&s) {
            Ok(Self(s))
        } else {
            Err(KeelError::InvalidTag { tag: s })
        }
    }

    /// A short random tag, used when mounting without an explicit name.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..5].to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Tag {
    fn default() -> Self {
        Self(DEFAULT_TAG.to_string())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Tag {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Tag {
    type Error = KeelError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

/// Human-readable `(name, tag)` handle resolving to at most one [`BuildId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildKey {
    pub name: String,
    pub tag: Tag,
}

impl BuildKey {
    pub fn new(name: impl Into<String>, tag: Tag) -> Self {
        Self { name: name.into(), tag }
    }

    /// Parse `name` or `name:tag`. A missing tag means the default tag.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || KeelError::InvalidBuildKey { value: s.to_string() };
        let (name, tag) = match s.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (s, DEFAULT_TAG),
        };
        if !is_name_valid(name) {
            return Err(invalid());
        }
        let tag = Tag::new(tag).map_err(|_| invalid())?;
        Ok(Self { name: name.to_string(), tag })
    }
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Persisted metadata sealing a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// The build this manifest belongs to.
    pub build_id: BuildId,

    /// The parent image, absent only for bases initialized from scratch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub based_on: Option<BuildId>,

    /// Kernel parameters, in declaration order, duplicates preserved.
    #[serde(default)]
    pub params: Vec<String>,
}

/// Denormalized view of a build, returned by enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfo {
    pub build_id: BuildId,
    pub based_on: Option<BuildId>,
    pub name: String,
    pub tags: Vec<Tag>,
    pub created_at: SystemTime,
    /// Where the dataset is currently mounted, if anywhere.
    pub mounted: Option<PathBuf>,
    pub params: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_type_properties() {
        assert!(BuildType::Image.properties().cloneable);
        assert!(!BuildType::Image.properties().mountable);
        assert!(BuildType::Mount.properties().mountable);
        assert!(!BuildType::Mount.properties().cloneable);
        assert!(!BuildType::Mount.properties().vm);
        assert!(BuildType::Boot.properties().mountable);
        assert!(BuildType::Boot.properties().vm);
    }

    #[test]
    fn test_build_type_parse() {
        assert_eq!(BuildType::parse("image"), Some(BuildType::Image));
        assert_eq!(BuildType::parse("BOOT"), Some(BuildType::Boot));
        assert_eq!(BuildType::parse("other"), None);
    }

    #[test]
    fn test_build_id_roundtrip() {
        let id = BuildId::generate(BuildType::Image);
        let parsed = BuildId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.build_type(), BuildType::Image);

        let boot = BuildId::generate(BuildType::Boot);
        assert!(boot.to_string().starts_with("boot-"));
    }

    #[test]
    fn test_build_id_rejects_garbage() {
        assert!(BuildId::parse("").is_err());
        assert!(BuildId::parse("img").is_err());
        assert!(BuildId::parse("img-short").is_err());
        assert!(BuildId::parse("zzz-0123456789abcdef0123456789abcdef").is_err());
        assert!(BuildId::parse("img-0123456789abcdef0123456789abcdeg").is_err());
    }

    #[test]
    fn test_build_id_serde() {
        let id = BuildId::generate(BuildType::Mount);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: BuildId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<BuildId>("\"not-an-id\"").is_err());
    }

    #[test]
    fn test_tag_validation() {
        assert!(Tag::new("latest").is_ok());
        assert!(Tag::new("v1.2-rc_3").is_ok());
        assert!(Tag::new("").is_err());
        assert!(Tag::new("with space").is_err());
        assert!(Tag::new("colon:").is_err());
        assert_eq!(Tag::default().as_str(), "latest");
    }

    #[test]
    fn test_tag_random() {
        let tag = Tag::random();
        assert_eq!(tag.as_str().len(), 5);
        assert_ne!(Tag::random(), Tag::random());
    }

    #[test]
    fn test_build_key_parse() {
        let key = BuildKey::parse("alpine").unwrap();
        assert_eq!(key.name, "alpine");
        assert_eq!(key.tag, Tag::default());

        let key = BuildKey::parse("app:v2").unwrap();
        assert_eq!(key.name, "app");
        assert_eq!(key.tag.as_str(), "v2");
        assert_eq!(key.to_string(), "app:v2");

        assert!(BuildKey::parse(":v2").is_err());
        assert!(BuildKey::parse("app:").is_err());
        assert!(BuildKey::parse("").is_err());
        assert!(BuildKey::parse("bad name:x").is_err());
    }

    #[test]
    fn test_manifest_serde_roundtrip() {
        let manifest = ImageManifest {
            build_id: BuildId::generate(BuildType::Image),
            based_on: Some(BuildId::generate(BuildType::Image)),
            params: vec!["console=ttyS0".to_string(), "quiet".to_string(), "quiet".to_string()],
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let back: ImageManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);

        let base = ImageManifest {
            build_id: BuildId::generate(BuildType::Image),
            based_on: None,
            params: Vec::new(),
        };
        let json = serde_json::to_string(&base).unwrap();
        let back: ImageManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, base);
    }
}
