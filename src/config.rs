//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/rollup.sqlite"
//!
//! [facts]
//! path = "./data/facts.sqlite"
//! data_root = "/var/sitedata"   # optional
//!
//! [pipeline]
//! batch_size = 100
//! staleness_hours = 24
//! step_delay_ms = 0
//!
//! [report]
//! show_empty = false
//! top_users = 10
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use storage_rollup_core::pipeline::{
    PipelineOptions, DEFAULT_BATCH_SIZE, DEFAULT_STALENESS_HOURS,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub facts: FactsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

/// Checkpoint/aggregate store location.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// File inventory location.
#[derive(Debug, Deserialize, Clone)]
pub struct FactsConfig {
    pub path: PathBuf,
    /// Storage root measured for the whole-site usage figure.
    #[serde(default)]
    pub data_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_staleness_hours")]
    pub staleness_hours: i64,
    #[serde(default)]
    pub step_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            staleness_hours: DEFAULT_STALENESS_HOURS,
            step_delay_ms: 0,
        }
    }
}

impl PipelineConfig {
    pub fn options(&self) -> PipelineOptions {
        PipelineOptions {
            batch_size: self.batch_size,
            staleness: chrono::Duration::hours(self.staleness_hours),
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_staleness_hours() -> i64 {
    DEFAULT_STALENESS_HOURS
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    #[serde(default)]
    pub show_empty: bool,
    #[serde(default = "default_top_users")]
    pub top_users: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            show_empty: false,
            top_users: default_top_users(),
        }
    }
}

fn default_top_users() -> usize {
    10
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.pipeline.batch_size == 0 {
        anyhow::bail!("pipeline.batch_size must be > 0");
    }

    if config.pipeline.staleness_hours <= 0 {
        anyhow::bail!("pipeline.staleness_hours must be > 0");
    }

    if let Some(root) = &config.facts.data_root {
        if !root.is_dir() {
            anyhow::bail!(
                "facts.data_root is not a directory: {}",
                root.display()
            );
        }
    }

    Ok(config)
}
