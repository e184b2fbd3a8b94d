//! Core data models for the storage rollup pipeline.
//!
//! These types describe the raw inventory rows read from the fact source,
//! the content mapping built from them, the running per-entity totals, and
//! the pipeline's own checkpointed state. Everything that is persisted
//! derives `Serialize`/`Deserialize` so it can travel through a
//! [`CheckpointStore`](crate::store::CheckpointStore) as JSON.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric context level of the site-wide system context.
pub const CONTEXT_LEVEL_SYSTEM: i64 = 10;
/// Numeric context level of a user context.
pub const CONTEXT_LEVEL_USER: i64 = 30;
/// Numeric context level of a course category context.
pub const CONTEXT_LEVEL_CATEGORY: i64 = 40;
/// Numeric context level of a course context.
pub const CONTEXT_LEVEL_COURSE: i64 = 50;

/// Kind of the context a stored blob is attached to.
///
/// Anything that is not one of the four well-known levels (activity
/// modules, blocks, unknown levels) is `Other` and gets resolved through
/// the context hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    System,
    User,
    Category,
    Course,
    Other,
}

impl ContextKind {
    pub fn from_level(level: i64) -> Self {
        match level {
            CONTEXT_LEVEL_SYSTEM => ContextKind::System,
            CONTEXT_LEVEL_USER => ContextKind::User,
            CONTEXT_LEVEL_CATEGORY => ContextKind::Category,
            CONTEXT_LEVEL_COURSE => ContextKind::Course,
            _ => ContextKind::Other,
        }
    }
}

/// One row of the file inventory, joined with its context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Monotonic, unique row id. The mapping cursor advances over it.
    pub id: i64,
    /// Content fingerprint; equal hashes mean byte-identical data.
    pub content_hash: String,
    pub byte_size: u64,
    pub is_backup: bool,
    /// Slash-delimited ancestor chain, root to leaf (e.g. `/1/3/15/27`).
    pub context_path: String,
    pub context_kind: ContextKind,
    /// Instance id of the context (user id, course id, category id, ...).
    pub owner_hint: i64,
}

/// Course metadata keyed by the course's context id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseInfo {
    pub course_id: i64,
    pub category_id: i64,
    pub shortname: String,
}

/// Pre-fetched `contextId → course` table used by the entity resolver.
#[derive(Debug, Clone, Default)]
pub struct CourseLookup {
    by_context: HashMap<i64, CourseInfo>,
    by_course: HashMap<i64, i64>,
}

impl CourseLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, context_id: i64, info: CourseInfo) {
        self.by_course.insert(info.course_id, context_id);
        self.by_context.insert(context_id, info);
    }

    pub fn by_context(&self, context_id: i64) -> Option<&CourseInfo> {
        self.by_context.get(&context_id)
    }

    pub fn by_course(&self, course_id: i64) -> Option<&CourseInfo> {
        self.by_course
            .get(&course_id)
            .and_then(|ctx| self.by_context.get(ctx))
    }

    /// Every known course, in no particular order.
    pub fn courses(&self) -> impl Iterator<Item = &CourseInfo> {
        self.by_context.values()
    }

    pub fn len(&self) -> usize {
        self.by_context.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_context.is_empty()
    }
}

impl FromIterator<(i64, CourseInfo)> for CourseLookup {
    fn from_iter<I: IntoIterator<Item = (i64, CourseInfo)>>(iter: I) -> Self {
        let mut lookup = CourseLookup::new();
        for (context_id, info) in iter {
            lookup.insert(context_id, info);
        }
        lookup
    }
}

/// Everything known about one distinct piece of content.
///
/// The four owner sets are deduplicated: an id appears at most once no
/// matter how many inventory rows reference the content under that owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMappingEntry {
    /// Size of one representative instance.
    pub byte_size: u64,
    /// True when any contributing row is a backup.
    #[serde(default)]
    pub is_backup: bool,
    #[serde(default)]
    pub users: BTreeSet<i64>,
    #[serde(default)]
    pub courses: BTreeSet<i64>,
    #[serde(default)]
    pub categories: BTreeSet<i64>,
    #[serde(default)]
    pub other: BTreeSet<i64>,
}

impl ContentMappingEntry {
    pub fn new(byte_size: u64, is_backup: bool) -> Self {
        Self {
            byte_size,
            is_backup,
            ..Default::default()
        }
    }

    /// Total number of owner references across all four sets.
    pub fn owner_count(&self) -> usize {
        self.users.len() + self.courses.len() + self.categories.len() + self.other.len()
    }
}

/// Running byte totals for one user, course, or category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAggregate {
    pub total: u64,
    pub unique: u64,
    pub backup: u64,
}

impl EntityAggregate {
    /// Account `size` bytes of content against this entity.
    pub fn add(&mut self, size: u64, unique: bool, backup: bool) {
        self.total += size;
        if unique {
            self.unique += size;
        }
        if backup {
            self.backup += size;
        }
        assert!(
            self.unique <= self.total,
            "unique bytes ({}) exceed total bytes ({})",
            self.unique,
            self.total
        );
    }
}

/// Per-course totals plus memoized descriptive metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseUsage {
    pub id: i64,
    pub shortname: String,
    pub category: i64,
    #[serde(flatten)]
    pub usage: EntityAggregate,
}

/// Per-category totals plus memoized display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryUsage {
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub usage: EntityAggregate,
}

/// Site-wide totals, counted once per distinct content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAggregate {
    pub total: u64,
    #[serde(default)]
    pub backup: u64,
}

/// Stage of a pipeline cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    MappingContent,
    Aggregating,
    Finalizing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::MappingContent => "mapping_content",
            Stage::Aggregating => "aggregating",
            Stage::Finalizing => "finalizing",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far the current stage has progressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    /// Nothing processed yet in this stage.
    Start,
    /// Last fact-source record id fully mapped.
    Record(i64),
    /// Last content-mapping key folded into the aggregates.
    Content(String),
}

/// Checkpointed state of the running cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub stage: Stage,
    pub cursor: Cursor,
    pub step: u64,
    pub step_total: u64,
    pub started_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(step_total: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            stage: Stage::MappingContent,
            cursor: Cursor::Start,
            step: 0,
            step_total,
            started_at,
        }
    }

    pub fn progress(&self) -> Progress {
        Progress::new(self.stage, self.step, self.step_total)
    }
}

/// Observable progress of the running cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Stage,
    pub step: u64,
    pub step_total: u64,
    /// `round(step / step_total * 100)`, absent when the total is zero.
    pub percent: Option<u32>,
}

impl Progress {
    pub fn new(stage: Stage, step: u64, step_total: u64) -> Self {
        let percent = if step_total != 0 {
            Some(((step as f64 / step_total as f64) * 100.0).round() as u32)
        } else {
            None
        };
        Self {
            stage,
            step,
            step_total,
            percent,
        }
    }
}

/// The last complete rollup, as consumed by reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSnapshot {
    pub published_at: DateTime<Utc>,
    /// Whole-site storage in megabytes, rounded up.
    pub total_site_megabytes: u64,
    pub system: SystemAggregate,
    pub courses: BTreeMap<i64, CourseUsage>,
    pub categories: BTreeMap<i64, CategoryUsage>,
    pub users: BTreeMap<i64, EntityAggregate>,
}
