//! Build command: evaluate spec files into stored images.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use keel_core::base::NoopInitializer;
use keel_core::isolator::ExecutorLauncher;
use keel_core::ops::{self, SpecRequest};
use keel_core::{BuildConfig, Builder, DirDriver, Repository, Tag};

use super::short_id;

pub async fn run(specs: Vec<PathBuf>, tags: Vec<String>, rebuild: bool) -> Result<()> {
    let tags = tags
        .into_iter()
        .map(|t| t.parse::<Tag>().with_context(|| format!("invalid tag {t:?}")))
        .collect::<Result<Vec<Tag>>>()?;

    let mut requests = Vec::with_capacity(specs.len());
    for spec_file in specs {
        let Some(name) = spec_file.file_name().and_then(|n| n.to_str()) else {
            bail!("cannot derive an image name from {}", spec_file.display());
        };
        requests.push(SpecRequest { spec_file: spec_file.clone(), name: name.to_string(), tags: tags.clone() });
    }

    let storage = Arc::new(DirDriver::new());
    let mut builder = Builder::new(
        BuildConfig { rebuild, ..BuildConfig::default() },
        Arc::new(NoopInitializer),
        Repository::new(),
        storage.clone(),
        Arc::new(ExecutorLauncher::new()),
    );

    // Ctrl-C unwinds the build through its regular cleanup.
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.cancel();
        }
    });

    let infos = ops::build(&cancel, &mut builder, storage.as_ref(), &requests).await?;
    for info in infos {
        let tags: Vec<String> = info.tags.iter().map(|t| format!("{}:{}", info.name, t)).collect();
        println!(
            "{} {} ({})",
            "built".green().bold(),
            tags.join(", "),
            short_id(&info.build_id)
        );
    }
    Ok(())
}
