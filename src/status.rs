//! Rollup status and usage report.
//!
//! Prints the state of the running cycle (if any), when results were last
//! published, whole-site totals, the heaviest users, and per-course and
//! per-category tables. Used by `rollup status`.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use storage_rollup_core::models::{CourseUsage, EntityAggregate, ResultSnapshot};
use storage_rollup_core::pipeline::Pipeline;
use storage_rollup_core::store::FactSource;

use crate::config::Config;
use crate::progress::format_number;
use crate::runner;

/// Run the status command: read progress and the published snapshot, print a summary.
pub async fn run_status(config: &Config, category: Option<i64>) -> Result<()> {
    let facts = runner::open_facts(config).await?;
    let checkpoints = runner::open_checkpoints(config).await?;
    let pipeline = Pipeline::new(
        facts.clone(),
        checkpoints.clone(),
        config.pipeline.options(),
    );

    println!("Storage Rollup Status");
    println!("=====================");
    println!();
    println!("  Checkpoints: {}", config.db.path.display());
    println!("  Inventory:   {}", config.facts.path.display());
    for (region, keys) in checkpoints.key_counts().await? {
        println!("    {:<12} {} key{}", region, keys, if keys == 1 { "" } else { "s" });
    }
    println!();

    match pipeline.get_progress().await? {
        Some(p) => {
            let percent = p
                .percent
                .map(|v| format!(" ({}%)", v))
                .unwrap_or_default();
            println!(
                "  Running:     {} {} / {}{}",
                p.stage,
                format_number(p.step),
                format_number(p.step_total),
                percent
            );
        }
        None => println!("  Running:     idle"),
    }

    let Some(snapshot) = pipeline.results().latest().await? else {
        println!("  Published:   never");
        println!();
        return Ok(());
    };

    let stale = pipeline.needs_refresh(chrono::Utc::now()).await?;
    println!(
        "  Published:   {}{}",
        format_ts_relative(snapshot.published_at.timestamp()),
        if stale { " (stale)" } else { "" }
    );
    println!("  Site usage:  {} MB", format_number(snapshot.total_site_megabytes));
    println!(
        "  Content:     {} ({} in backups)",
        format_bytes(snapshot.system.total),
        format_bytes(snapshot.system.backup)
    );

    let view = match category {
        Some(id) => {
            if facts.category_name(id).await?.is_none() {
                bail!("Unknown category: {}", id);
            }
            let mut allowed = facts.category_descendants(id).await?;
            allowed.push(id);
            snapshot.filter_by_categories(&allowed)
        }
        None => snapshot,
    };

    print_users(facts.as_ref(), &view, config.report.top_users).await?;

    let courses = course_rows(facts.as_ref(), &view, category, config.report.show_empty).await?;
    if !courses.is_empty() {
        println!();
        println!("  By course:");
        println!(
            "  {:<8} {:<24} {:>8} {:>12} {:>12} {:>12}",
            "ID", "SHORTNAME", "CATEGORY", "TOTAL", "UNIQUE", "BACKUP"
        );
        println!("  {}", "-".repeat(82));
        for c in &courses {
            println!(
                "  {:<8} {:<24} {:>8} {:>12} {:>12} {:>12}",
                c.id,
                c.shortname,
                c.category,
                format_bytes(c.usage.total),
                format_bytes(c.usage.unique),
                format_bytes(c.usage.backup)
            );
        }
    }

    if !view.categories.is_empty() {
        println!();
        println!("  By category:");
        println!(
            "  {:<8} {:<24} {:>12} {:>12} {:>12}",
            "ID", "NAME", "TOTAL", "UNIQUE", "BACKUP"
        );
        println!("  {}", "-".repeat(73));
        let mut categories: Vec<_> = view.categories.values().collect();
        categories.sort_by(|a, b| b.usage.total.cmp(&a.usage.total).then(a.id.cmp(&b.id)));
        for c in categories {
            println!(
                "  {:<8} {:<24} {:>12} {:>12} {:>12}",
                c.id,
                c.name,
                format_bytes(c.usage.total),
                format_bytes(c.usage.unique),
                format_bytes(c.usage.backup)
            );
        }
    }

    println!();
    Ok(())
}

async fn print_users(facts: &dyn FactSource, view: &ResultSnapshot, n: usize) -> Result<()> {
    let top = view.top_users(n);
    if top.is_empty() {
        return Ok(());
    }

    println!();
    println!("  Top users:");
    println!("  {:<8} {:<28} {:>12} {:>12}", "ID", "NAME", "TOTAL", "UNIQUE");
    println!("  {}", "-".repeat(64));
    for (id, usage) in top {
        let name = facts.user_name(id).await?.unwrap_or_else(|| "?".to_string());
        println!(
            "  {:<8} {:<28} {:>12} {:>12}",
            id,
            name,
            format_bytes(usage.total),
            format_bytes(usage.unique)
        );
    }
    Ok(())
}

/// Courses to list, largest first. With `show_empty`, courses without any
/// stored content are added with zero usage.
async fn course_rows(
    facts: &dyn FactSource,
    view: &ResultSnapshot,
    category: Option<i64>,
    show_empty: bool,
) -> Result<Vec<CourseUsage>> {
    let mut rows: BTreeMap<i64, CourseUsage> = view
        .courses
        .iter()
        .filter(|(_, c)| show_empty || c.usage.total > 0)
        .map(|(id, c)| (*id, c.clone()))
        .collect();

    if show_empty {
        let allowed = match category {
            Some(id) => {
                let mut ids = facts.category_descendants(id).await?;
                ids.push(id);
                Some(ids)
            }
            None => None,
        };
        let lookup = facts.course_lookup().await?;
        for info in lookup.courses() {
            if allowed
                .as_ref()
                .is_some_and(|ids| !ids.contains(&info.category_id))
            {
                continue;
            }
            rows.entry(info.course_id).or_insert_with(|| CourseUsage {
                id: info.course_id,
                shortname: info.shortname.clone(),
                category: info.category_id,
                usage: EntityAggregate::default(),
            });
        }
    }

    let mut rows: Vec<CourseUsage> = rows.into_values().collect();
    rows.sort_by(|a, b| b.usage.total.cmp(&a.usage.total).then(a.id.cmp(&b.id)));
    Ok(rows)
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
