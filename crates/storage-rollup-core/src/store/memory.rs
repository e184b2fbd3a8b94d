//! In-memory [`FactSource`] and [`CheckpointStore`] implementations.
//!
//! Backed by `HashMap`/`BTreeMap` behind `std::sync::RwLock`. Used by the
//! test suites and by embedders that persist state some other way.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::{ContentRecord, ContextKind, CourseInfo, CourseLookup};

use super::{CheckpointStore, FactSource, Region};

struct StoredCategory {
    name: String,
    parent: i64,
}

/// In-memory file inventory.
#[derive(Default)]
pub struct InMemoryFactSource {
    records: RwLock<Vec<ContentRecord>>,
    courses: RwLock<Vec<(i64, CourseInfo)>>,
    categories: RwLock<HashMap<i64, StoredCategory>>,
    users: RwLock<HashMap<i64, String>>,
    site_bytes: RwLock<Option<u64>>,
}

impl InMemoryFactSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Ids must be added in ascending order.
    pub fn add_record(&self, record: ContentRecord) {
        self.records.write().unwrap().push(record);
    }

    /// Register a course living at `context_id`.
    pub fn add_course(&self, context_id: i64, course_id: i64, category_id: i64, shortname: &str) {
        self.courses.write().unwrap().push((
            context_id,
            CourseInfo {
                course_id,
                category_id,
                shortname: shortname.to_string(),
            },
        ));
    }

    /// Register a category; `parent` is 0 for top-level categories.
    pub fn add_category(&self, id: i64, parent: i64, name: &str) {
        self.categories.write().unwrap().insert(
            id,
            StoredCategory {
                name: name.to_string(),
                parent,
            },
        );
    }

    pub fn add_user(&self, id: i64, name: &str) {
        self.users.write().unwrap().insert(id, name.to_string());
    }

    pub fn set_site_usage_bytes(&self, bytes: Option<u64>) {
        *self.site_bytes.write().unwrap() = bytes;
    }
}

#[async_trait]
impl FactSource for InMemoryFactSource {
    async fn fetch_records(&self, after_id: i64, limit: usize) -> Result<Vec<ContentRecord>> {
        let records = self.records.read().unwrap();
        let mut found: Vec<ContentRecord> = records
            .iter()
            .filter(|r| r.id > after_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.id);
        found.truncate(limit);
        Ok(found)
    }

    async fn count_records(&self) -> Result<u64> {
        Ok(self.records.read().unwrap().len() as u64)
    }

    async fn course_lookup(&self) -> Result<CourseLookup> {
        Ok(self.courses.read().unwrap().iter().cloned().collect())
    }

    async fn category_name(&self, category_id: i64) -> Result<Option<String>> {
        Ok(self
            .categories
            .read()
            .unwrap()
            .get(&category_id)
            .map(|c| c.name.clone()))
    }

    async fn user_name(&self, user_id: i64) -> Result<Option<String>> {
        Ok(self.users.read().unwrap().get(&user_id).cloned())
    }

    async fn category_descendants(&self, category_id: i64) -> Result<Vec<i64>> {
        let categories = self.categories.read().unwrap();
        let mut found = Vec::new();
        let mut frontier = vec![category_id];
        while let Some(parent) = frontier.pop() {
            let mut children: Vec<i64> = categories
                .iter()
                .filter(|(_, c)| c.parent == parent)
                .map(|(id, _)| *id)
                .collect();
            children.sort_unstable();
            found.extend(children.iter().copied());
            frontier.extend(children);
        }
        found.sort_unstable();
        Ok(found)
    }

    async fn site_usage_bytes(&self) -> Result<Option<u64>> {
        Ok(*self.site_bytes.read().unwrap())
    }
}

/// In-memory checkpoint store.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    regions: RwLock<HashMap<Region, BTreeMap<String, Value>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored in `region`, in order.
    pub fn keys(&self, region: Region) -> Vec<String> {
        self.regions
            .read()
            .unwrap()
            .get(&region)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, region: Region, key: &str) -> Result<Option<Value>> {
        Ok(self
            .regions
            .read()
            .unwrap()
            .get(&region)
            .and_then(|r| r.get(key).cloned()))
    }

    async fn set(&self, region: Region, key: &str, value: Value) -> Result<()> {
        self.regions
            .write()
            .unwrap()
            .entry(region)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, region: Region, key: &str) -> Result<()> {
        if let Some(r) = self.regions.write().unwrap().get_mut(&region) {
            r.remove(key);
        }
        Ok(())
    }

    async fn purge(&self, region: Region) -> Result<()> {
        self.regions.write().unwrap().remove(&region);
        Ok(())
    }
}

/// Shorthand for building a [`ContentRecord`] in tests and fixtures.
pub fn record(
    id: i64,
    content_hash: &str,
    byte_size: u64,
    context_kind: ContextKind,
    context_path: &str,
    owner_hint: i64,
) -> ContentRecord {
    ContentRecord {
        id,
        content_hash: content_hash.to_string(),
        byte_size,
        is_backup: false,
        context_path: context_path.to_string(),
        context_kind,
        owner_hint,
    }
}
