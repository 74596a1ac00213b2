//! Subcommand implementations for the keel CLI.

pub mod build;
pub mod drop;
pub mod images;
pub mod mount;

use anyhow::{bail, Result};
use keel_core::ops::{Filter, KeyPattern};
use keel_core::{BuildId, BuildType};

/// Turn positional selectors and flags into a build filter. Each selector is
/// a build ID when it parses as one, otherwise a name[:tag] pattern.
pub fn parse_filter(selectors: &[String], types: &[String], untagged: bool) -> Result<Filter> {
    let mut filter = Filter { untagged, ..Filter::default() };

    for selector in selectors {
        if let Ok(id) = BuildId::parse(selector) {
            filter.build_ids.push(id);
        } else {
            filter.keys.push(KeyPattern::parse(selector)?);
        }
    }

    for name in types {
        match BuildType::parse(name) {
            Some(build_type) => filter.types.push(build_type),
            None => bail!("unknown build type {name:?}, expected image, mount or boot"),
        }
    }

    Ok(filter)
}

/// First 12 characters of the hex suffix, like short commit hashes.
pub fn short_id(id: &BuildId) -> String {
    let full = id.to_string();
    match full.split_once('-') {
        Some((prefix, suffix)) => format!("{prefix}-{}", &suffix[..12.min(suffix.len())]),
        None => full,
    }
}

/// Relative age for table output.
pub fn format_age(created_at: std::time::SystemTime) -> String {
    let elapsed = std::time::SystemTime::now().duration_since(created_at).unwrap_or_default();
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter_mixes_ids_and_keys() {
        let id = BuildId::generate(BuildType::Image);
        let filter =
            parse_filter(&[id.to_string(), "app:v1".to_string()], &["image".to_string()], false)
                .unwrap();
        assert_eq!(filter.build_ids, vec![id]);
        assert_eq!(filter.keys.len(), 1);
        assert_eq!(filter.types, vec![BuildType::Image]);
    }

    #[test]
    fn test_parse_filter_rejects_unknown_type() {
        assert!(parse_filter(&[], &["volume".to_string()], false).is_err());
    }

    #[test]
    fn test_short_id() {
        let id = BuildId::generate(BuildType::Image);
        let short = short_id(&id);
        assert!(short.starts_with("img-"));
        assert_eq!(short.len(), "img-".len() + 12);
    }
}
