//! In-memory repository of predefined image descriptors.
//!
//! The build engine consults the repository as its last resolution fallback:
//! a `FROM` whose target has neither a stored image nor a spec file may still
//! be satisfied by a descriptor registered here.

use std::collections::HashMap;

use crate::spec::Descriptor;
use crate::types::{BuildKey, Tag};

/// Lookup from build key to descriptor.
#[derive(Default)]
pub struct Repository {
    images: HashMap<BuildKey, Descriptor>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under every `(name, tag)` key it carries.
    pub fn store(&mut self, descriptor: Descriptor) {
        let tags: Vec<Tag> = if descriptor.tags().is_empty() {
            vec![Tag::default()]
        } else {
            descriptor.tags().to_vec()
        };
        for tag in tags {
            self.images.insert(BuildKey::new(descriptor.name(), tag), descriptor.clone());
        }
    }

    /// Look up the descriptor registered for `key`.
    pub fn retrieve(&self, key: &BuildKey) -> Option<&Descriptor> {
        self.images.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::describe;

    #[test]
    fn test_store_and_retrieve() {
        let mut repo = Repository::new();
        repo.store(describe("base", vec![Tag::default(), Tag::new("v1").unwrap()], Vec::new()));

        assert!(repo.retrieve(&BuildKey::parse("base").unwrap()).is_some());
        assert!(repo.retrieve(&BuildKey::parse("base:v1").unwrap()).is_some());
        assert!(repo.retrieve(&BuildKey::parse("base:v2").unwrap()).is_none());
        assert!(repo.retrieve(&BuildKey::parse("other").unwrap()).is_none());
    }

    #[test]
    fn test_untagged_descriptor_registers_default() {
        let mut repo = Repository::new();
        repo.store(describe("base", Vec::new(), Vec::new()));
        assert!(repo.retrieve(&BuildKey::parse("base:latest").unwrap()).is_some());
    }
}
