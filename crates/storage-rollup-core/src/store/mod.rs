//! Collaborator abstractions for Storage Rollup.
//!
//! The pipeline talks to exactly two external collaborators:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`FactSource`] | Read-only file inventory plus course/category/user lookups |
//! | [`CheckpointStore`] | Durable key-value store for progress, mapping, aggregates, and results |
//!
//! Both are async (via `async-trait`) so native backends (SQLite through
//! sqlx) and the in-memory implementations in [`memory`] share one
//! interface. Implementations must be `Send + Sync`.

pub mod memory;

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::models::{ContentRecord, CourseLookup};

/// Named region of the checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    /// Pipeline state of the running cycle.
    Progress,
    /// Content mapping under construction, plus the record cursor.
    Mapping,
    /// Running per-entity totals.
    Aggregates,
    /// Last published snapshot.
    Results,
}

impl Region {
    pub const ALL: [Region; 4] = [
        Region::Progress,
        Region::Mapping,
        Region::Aggregates,
        Region::Results,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Progress => "progress",
            Region::Mapping => "mapping",
            Region::Aggregates => "aggregates",
            Region::Results => "results",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "progress" => Ok(Region::Progress),
            "mapping" => Ok(Region::Mapping),
            "aggregates" => Ok(Region::Aggregates),
            "results" => Ok(Region::Results),
            other => bail!(
                "Unknown region: '{}'. Available: progress, mapping, aggregates, results",
                other
            ),
        }
    }
}

/// Durable key-value store scoped by [`Region`].
///
/// Only single-key atomicity is assumed: one `set` either lands completely
/// or not at all. The pipeline lays out its state so that this suffices.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, region: Region, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, region: Region, key: &str, value: Value) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, region: Region, key: &str) -> Result<()>;

    /// Remove every key in `region`.
    async fn purge(&self, region: Region) -> Result<()>;
}

/// Read and deserialize a typed value from the store.
pub async fn load<T: DeserializeOwned>(
    store: &dyn CheckpointStore,
    region: Region,
    key: &str,
) -> Result<Option<T>> {
    match store.get(region, key).await? {
        Some(value) => {
            let parsed = serde_json::from_value(value)
                .with_context(|| format!("Corrupt checkpoint value at {}/{}", region, key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Serialize and store a typed value.
pub async fn save<T: Serialize + Sync>(
    store: &dyn CheckpointStore,
    region: Region,
    key: &str,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_value(value)?;
    store.set(region, key, json).await
}

/// Read-only view of the file inventory and its surrounding hierarchy.
#[async_trait]
pub trait FactSource: Send + Sync {
    /// Up to `limit` records with `id > after_id`, ascending by `id`.
    async fn fetch_records(&self, after_id: i64, limit: usize) -> Result<Vec<ContentRecord>>;

    /// Total number of inventory records.
    async fn count_records(&self) -> Result<u64>;

    /// `contextId → course` table for every course-level context.
    async fn course_lookup(&self) -> Result<CourseLookup>;

    /// Display name of a course category.
    async fn category_name(&self, category_id: i64) -> Result<Option<String>>;

    /// Display name of a user.
    async fn user_name(&self, user_id: i64) -> Result<Option<String>>;

    /// Ids of every category nested under `category_id` (not including it).
    async fn category_descendants(&self, category_id: i64) -> Result<Vec<i64>>;

    /// Raw bytes used by the whole site's storage root, when measurable.
    async fn site_usage_bytes(&self) -> Result<Option<u64>>;
}
