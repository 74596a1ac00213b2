//! Mount command: clone an image into a long-lived mounted instance.

use anyhow::{Context, Result};
use colored::Colorize;

use keel_core::ops::{self, KeyPattern, MountRequest};
use keel_core::{BuildId, BuildKey, BuildType, DirDriver};

use super::short_id;

pub fn run(image: String, name: Option<String>, boot: bool) -> Result<()> {
    let (build_id, key) = match BuildId::parse(&image) {
        Ok(id) => (Some(id), None),
        Err(_) => {
            let key = BuildKey::parse(&image)
                .with_context(|| format!("{image:?} is neither a build ID nor a build key"))?;
            (None, Some(key))
        }
    };

    let target = name.as_deref().map(KeyPattern::parse).transpose()?;
    let request = MountRequest {
        build_id,
        key,
        target,
        build_type: if boot { BuildType::Boot } else { BuildType::Mount },
    };

    let driver = DirDriver::new();
    let info = ops::mount_build(&driver, &request, &keel_core::paths::mounts_dir())?;

    let mounted = info
        .mounted
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let tags: Vec<String> = info.tags.iter().map(|t| format!("{}:{}", info.name, t)).collect();
    println!(
        "{} {} ({}) at {}",
        "mounted".green().bold(),
        tags.join(", "),
        short_id(&info.build_id),
        mounted
    );
    Ok(())
}
