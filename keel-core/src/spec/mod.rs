//! Build descriptors: the in-memory representation of a build spec.

pub mod parser;

use crate::types::{BuildKey, Tag};

/// A single directive from a build spec.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Clone the named base image and inherit its manifest.
    From(BuildKey),
    /// Append kernel parameters. Declaration order is authoritative and
    /// duplicates are preserved.
    Params(Vec<String>),
    /// Execute a shell command inside the isolator.
    Run(String),
}

/// Name, tags and ordered command list for one build.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    name: String,
    tags: Vec<Tag>,
    commands: Vec<Command>,
}

impl Descriptor {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

/// Build a descriptor. An empty command list describes a base image.
pub fn describe(name: impl Into<String>, tags: Vec<Tag>, commands: Vec<Command>) -> Descriptor {
    Descriptor { name: name.into(), tags, commands }
}
