//! Drop command: delete builds in dependency order.

use anyhow::{bail, Result};
use colored::Colorize;

use keel_core::ops;
use keel_core::DirDriver;

use super::{parse_filter, short_id};

pub fn run(filters: Vec<String>, all: bool, untagged: bool, types: Vec<String>) -> Result<()> {
    let filter = parse_filter(&filters, &types, untagged)?;
    let driver = DirDriver::new();
    let results = ops::drop_builds(&driver, &filter, all)?;

    let mut failed = false;
    for result in &results {
        match &result.error {
            None => println!("{} {}", "dropped".green(), short_id(&result.build_id)),
            Some(err) => {
                failed = true;
                println!("{} {}: {err}", "failed".red().bold(), short_id(&result.build_id));
            }
        }
    }
    if failed {
        bail!("some drops failed");
    }
    Ok(())
}
