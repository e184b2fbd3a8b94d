//! Export the published snapshot as JSON.
//!
//! Lets other tools consume rollup results without reading the checkpoint
//! database directly. One section or the whole snapshot can be exported.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::path::Path;

use storage_rollup_core::models::ResultSnapshot;

use crate::config::Config;
use crate::runner;

/// Which part of the snapshot to export.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ExportSection {
    Courses,
    Categories,
    Users,
    System,
    All,
}

/// JSON document for one section of `snapshot`.
///
/// Per-entity sections are arrays ordered by id; `system` and `all` carry
/// the publication time and whole-site megabytes.
pub fn section_json(snapshot: &ResultSnapshot, section: ExportSection) -> Result<Value> {
    Ok(match section {
        ExportSection::Courses => serde_json::to_value(snapshot.courses.values().collect::<Vec<_>>())?,
        ExportSection::Categories => {
            serde_json::to_value(snapshot.categories.values().collect::<Vec<_>>())?
        }
        ExportSection::Users => Value::Array(
            snapshot
                .users
                .iter()
                .map(|(id, usage)| {
                    json!({
                        "id": id,
                        "total": usage.total,
                        "unique": usage.unique,
                        "backup": usage.backup,
                    })
                })
                .collect(),
        ),
        ExportSection::System => json!({
            "published_at": snapshot.published_at,
            "total_site_megabytes": snapshot.total_site_megabytes,
            "total": snapshot.system.total,
            "backup": snapshot.system.backup,
        }),
        ExportSection::All => serde_json::to_value(snapshot)?,
    })
}

/// Export part of the published snapshot.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(
    config: &Config,
    section: ExportSection,
    output: Option<&Path>,
) -> Result<()> {
    let pipeline = runner::open_pipeline(config).await?;
    let Some(snapshot) = pipeline.results().latest().await? else {
        bail!("No results published yet (run `rollup run` first)");
    };

    let json = serde_json::to_string_pretty(&section_json(&snapshot, section)?)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, &json)?;
            eprintln!(
                "Exported {:?} ({} courses, {} categories, {} users) to {}",
                section,
                snapshot.courses.len(),
                snapshot.categories.len(),
                snapshot.users.len(),
                path.display()
            );
        }
        None => {
            println!("{}", json);
        }
    }

    Ok(())
}
