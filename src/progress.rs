//! Step progress reporting.
//!
//! Reports what each `rollup step` / `rollup run` invocation did so operators
//! can watch a cycle move through mapping, aggregation, and publication.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use storage_rollup_core::models::{Progress, Stage};

/// A single progress event for a rollup cycle.
#[derive(Clone, Debug)]
pub enum StepProgressEvent {
    /// One invocation finished and the cycle continues.
    Step {
        stage: Stage,
        handled: usize,
        progress: Progress,
    },
    /// The cycle finished and a snapshot was published.
    Published {
        courses: usize,
        categories: usize,
        users: usize,
        total_site_megabytes: u64,
    },
}

/// Reports step progress. Implementations write to stderr (human or JSON).
pub trait StepProgressReporter: Send + Sync {
    fn report(&self, event: StepProgressEvent);
}

/// Human-friendly progress on stderr: "rollup aggregating  120 handled  1,200 / 5,000 (24%)".
pub struct StderrProgress;

impl StepProgressReporter for StderrProgress {
    fn report(&self, event: StepProgressEvent) {
        let line = match &event {
            StepProgressEvent::Step {
                stage,
                handled,
                progress,
            } => {
                let percent = progress
                    .percent
                    .map(|p| format!(" ({}%)", p))
                    .unwrap_or_default();
                format!(
                    "rollup {}  {} handled  now {} {} / {}{}\n",
                    stage,
                    format_number(*handled as u64),
                    progress.stage,
                    format_number(progress.step),
                    format_number(progress.step_total),
                    percent
                )
            }
            StepProgressEvent::Published {
                courses,
                categories,
                users,
                total_site_megabytes,
            } => format!(
                "rollup published  {} courses, {} categories, {} users, {} MB site usage\n",
                format_number(*courses as u64),
                format_number(*categories as u64),
                format_number(*users as u64),
                format_number(*total_site_megabytes)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl StepProgressReporter for JsonProgress {
    fn report(&self, event: StepProgressEvent) {
        let obj = match &event {
            StepProgressEvent::Step {
                stage,
                handled,
                progress,
            } => serde_json::json!({
                "event": "step",
                "stage": stage.as_str(),
                "handled": handled,
                "next_stage": progress.stage.as_str(),
                "step": progress.step,
                "step_total": progress.step_total,
                "percent": progress.percent,
            }),
            StepProgressEvent::Published {
                courses,
                categories,
                users,
                total_site_megabytes,
            } => serde_json::json!({
                "event": "published",
                "courses": courses,
                "categories": categories,
                "users": users,
                "total_site_megabytes": total_site_megabytes,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl StepProgressReporter for NoProgress {
    fn report(&self, _event: StepProgressEvent) {}
}

/// Format an integer with thousands separators.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn StepProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
