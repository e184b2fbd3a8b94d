//! Drives the rollup pipeline from the CLI.
//!
//! Opens the SQLite-backed stores named in the configuration, runs one or
//! more bounded invocations of [`Pipeline`], and prints a short summary on
//! stdout. Per-invocation progress goes through a
//! [`StepProgressReporter`] on stderr.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use storage_rollup_core::models::ResultSnapshot;
use storage_rollup_core::pipeline::{Pipeline, StepOutcome, StepReport};
use storage_rollup_core::store::{CheckpointStore, Region};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::progress::{StepProgressEvent, StepProgressReporter};
use crate::sqlite_store::{SqliteCheckpointStore, SqliteFactSource};

/// Open the fact source named by `[facts]`.
///
/// Unlike the checkpoint database, the inventory is never created on demand:
/// a missing file almost always means a wrong path.
pub async fn open_facts(config: &Config) -> Result<Arc<SqliteFactSource>> {
    if !config.facts.path.exists() {
        bail!(
            "Facts database not found: {} (run `rollup init --facts` to create an empty one)",
            config.facts.path.display()
        );
    }
    let pool = db::connect_facts(config).await?;
    Ok(Arc::new(SqliteFactSource::new(
        pool,
        config.facts.data_root.clone(),
    )))
}

/// Open the checkpoint store named by `[db]`, creating its schema if needed.
pub async fn open_checkpoints(config: &Config) -> Result<Arc<SqliteCheckpointStore>> {
    let pool = db::connect(config).await?;
    migrate::create_checkpoint_schema(&pool).await?;
    Ok(Arc::new(SqliteCheckpointStore::new(pool)))
}

pub async fn open_pipeline(config: &Config) -> Result<Pipeline> {
    let facts = open_facts(config).await?;
    let checkpoints = open_checkpoints(config).await?;
    Ok(Pipeline::new(facts, checkpoints, config.pipeline.options()))
}

/// Run exactly one invocation.
pub async fn run_step(config: &Config, reporter: &dyn StepProgressReporter) -> Result<()> {
    let pipeline = open_pipeline(config).await?;
    let report = pipeline
        .run_one_step()
        .await
        .context("Rollup step failed")?;
    emit(reporter, &report);

    println!("step {}", report.stage);
    println!("  handled: {}", report.handled);
    match &report.outcome {
        StepOutcome::Continue(progress) => {
            println!(
                "  next: {} {} / {}",
                progress.stage, progress.step, progress.step_total
            );
        }
        StepOutcome::Complete(snapshot) => print_published(snapshot),
    }
    println!("ok");
    Ok(())
}

/// Invoke the pipeline until the cycle publishes or `max_steps` is reached.
///
/// With `if_stale`, nothing runs while the published snapshot is fresh and
/// no cycle is in flight.
pub async fn run_cycle(
    config: &Config,
    if_stale: bool,
    max_steps: Option<usize>,
    reporter: &dyn StepProgressReporter,
) -> Result<()> {
    let pipeline = open_pipeline(config).await?;

    if if_stale
        && pipeline.get_progress().await?.is_none()
        && !pipeline.needs_refresh(chrono::Utc::now()).await?
    {
        println!("run skipped: published results are fresh");
        println!("ok");
        return Ok(());
    }

    let delay = Duration::from_millis(config.pipeline.step_delay_ms);
    let mut steps = 0usize;

    loop {
        if max_steps.is_some_and(|max| steps >= max) {
            let progress = pipeline.get_progress().await?;
            println!("run paused after {} steps", steps);
            if let Some(p) = progress {
                println!("  stage: {} {} / {}", p.stage, p.step, p.step_total);
            }
            println!("ok");
            return Ok(());
        }

        let report = pipeline
            .run_one_step()
            .await
            .with_context(|| format!("Rollup step {} failed", steps + 1))?;
        steps += 1;
        emit(reporter, &report);
        debug!(step = steps, stage = %report.stage, handled = report.handled, "step finished");

        if let StepOutcome::Complete(snapshot) = &report.outcome {
            println!("run complete after {} steps", steps);
            print_published(snapshot);
            println!("ok");
            return Ok(());
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Delete state in the named regions, or all regions when none are named.
///
/// Only the checkpoint database is opened, so state can be reset while the
/// inventory is unavailable.
pub async fn run_purge(config: &Config, regions: &[String]) -> Result<()> {
    let mut regions = regions
        .iter()
        .map(|r| r.parse::<Region>())
        .collect::<Result<Vec<_>>>()?;
    if regions.is_empty() {
        regions = Region::ALL.to_vec();
    }

    let checkpoints = open_checkpoints(config).await?;
    for region in &regions {
        checkpoints
            .purge(*region)
            .await
            .with_context(|| format!("Failed to purge region {}", region))?;
        info!(region = %region, "purged region");
    }

    let purged: Vec<&str> = regions.iter().map(|r| r.as_str()).collect();
    println!("purged: {}", purged.join(", "));
    println!("ok");
    Ok(())
}

fn emit(reporter: &dyn StepProgressReporter, report: &StepReport) {
    match &report.outcome {
        StepOutcome::Continue(progress) => reporter.report(StepProgressEvent::Step {
            stage: report.stage,
            handled: report.handled,
            progress: progress.clone(),
        }),
        StepOutcome::Complete(snapshot) => reporter.report(StepProgressEvent::Published {
            courses: snapshot.courses.len(),
            categories: snapshot.categories.len(),
            users: snapshot.users.len(),
            total_site_megabytes: snapshot.total_site_megabytes,
        }),
    }
}

fn print_published(snapshot: &ResultSnapshot) {
    println!("  published: {}", snapshot.published_at.to_rfc3339());
    println!("  courses: {}", snapshot.courses.len());
    println!("  categories: {}", snapshot.categories.len());
    println!("  users: {}", snapshot.users.len());
    println!("  site usage: {} MB", snapshot.total_site_megabytes);
}
