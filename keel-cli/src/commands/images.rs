//! Images command: list builds as a table.

use anyhow::Result;
use tabled::{Table, Tabled};

use keel_core::ops;
use keel_core::DirDriver;

use super::{format_age, parse_filter, short_id};

pub fn run(filters: Vec<String>, types: Vec<String>, untagged: bool) -> Result<()> {
    let filter = parse_filter(&filters, &types, untagged)?;
    let driver = DirDriver::new();
    let mut infos = ops::list(&driver, &filter)?;
    infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    if infos.is_empty() {
        println!("No builds found.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct BuildRow {
        #[tabled(rename = "BUILD ID")]
        build_id: String,
        #[tabled(rename = "TYPE")]
        build_type: String,
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "TAGS")]
        tags: String,
        #[tabled(rename = "BASED ON")]
        based_on: String,
        #[tabled(rename = "MOUNTED")]
        mounted: String,
        #[tabled(rename = "CREATED")]
        created: String,
    }

    let rows: Vec<BuildRow> = infos
        .iter()
        .map(|info| BuildRow {
            build_id: short_id(&info.build_id),
            build_type: info.build_id.build_type().to_string(),
            name: info.name.clone(),
            tags: info
                .tags
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
            based_on: info.based_on.as_ref().map(short_id).unwrap_or_else(|| "-".to_string()),
            mounted: info
                .mounted
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            created: format_age(info.created_at),
        })
        .collect();

    println!("{}", Table::new(rows));
    Ok(())
}
