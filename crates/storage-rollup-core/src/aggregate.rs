//! Aggregation: folding content mapping entries into per-entity totals.
//!
//! Pending entries are consumed in ascending content-hash order. The
//! running totals and the key cursor live together in one value in
//! [`Region::Aggregates`]; once that value is written, the folded entries
//! are dropped from the mapping. Entries at or below the cursor are never
//! folded again, even if the drop did not land.

use std::collections::BTreeMap;
use std::ops::Bound;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mapping::{MappingCheckpoint, MAPPING_KEY};
use crate::models::{
    CategoryUsage, ContentMappingEntry, CourseLookup, CourseUsage, Cursor, EntityAggregate,
    PipelineState, SystemAggregate,
};
use crate::store::{load, save, CheckpointStore, FactSource, Region};

/// Key of the running totals inside [`Region::Aggregates`].
pub const AGGREGATES_KEY: &str = "aggregates";

/// Durable running totals of the current cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCheckpoint {
    /// Last content hash folded in.
    pub cursor: Option<String>,
    /// Number of entries folded so far.
    pub folded: u64,
    pub system: SystemAggregate,
    pub users: BTreeMap<i64, EntityAggregate>,
    pub courses: BTreeMap<i64, CourseUsage>,
    pub categories: BTreeMap<i64, CategoryUsage>,
}

impl AggregateCheckpoint {
    /// Account one content entry against every entity that owns it.
    ///
    /// System totals grow once per entry regardless of owner count.
    pub fn fold(&mut self, entry: &ContentMappingEntry) {
        let size = entry.byte_size;
        let backup = entry.is_backup;

        self.system.total += size;
        if backup {
            self.system.backup += size;
        }

        let sole_user = entry.users.len() == 1
            && entry.courses.is_empty()
            && entry.categories.is_empty()
            && entry.other.is_empty();
        // The course's own category is always listed alongside it.
        let sole_course =
            entry.courses.len() == 1 && entry.users.is_empty() && entry.other.is_empty();
        let sole_category =
            entry.categories.len() == 1 && entry.users.is_empty() && entry.other.is_empty();

        for id in &entry.users {
            self.users
                .entry(*id)
                .or_default()
                .add(size, sole_user, backup);
        }

        for id in &entry.courses {
            let course = self.courses.entry(*id).or_insert_with(|| CourseUsage {
                id: *id,
                ..Default::default()
            });
            course.usage.add(size, sole_course, backup);
        }

        for id in &entry.categories {
            let category = self.categories.entry(*id).or_insert_with(|| CategoryUsage {
                id: *id,
                ..Default::default()
            });
            category.usage.add(size, sole_category, backup);
        }

        self.folded += 1;
    }
}

/// Outcome of one aggregation batch.
#[derive(Debug, Clone)]
pub struct AggregationStep {
    pub state: PipelineState,
    /// Entries folded in this batch.
    pub folded: usize,
    /// Entries still pending; zero means aggregation is complete.
    pub remaining: usize,
}

/// Consumes the content mapping into running per-entity totals.
pub struct AggregationAccumulator<'a> {
    facts: &'a dyn FactSource,
    store: &'a dyn CheckpointStore,
    lookup: &'a CourseLookup,
}

impl<'a> AggregationAccumulator<'a> {
    pub fn new(
        facts: &'a dyn FactSource,
        store: &'a dyn CheckpointStore,
        lookup: &'a CourseLookup,
    ) -> Self {
        Self {
            facts,
            store,
            lookup,
        }
    }

    /// Fold up to `limit` pending mapping entries.
    pub async fn advance(&self, mut state: PipelineState, limit: usize) -> Result<AggregationStep> {
        let mut mapping: MappingCheckpoint = load(self.store, Region::Mapping, MAPPING_KEY)
            .await?
            .unwrap_or_default();
        let mut totals: AggregateCheckpoint = load(self.store, Region::Aggregates, AGGREGATES_KEY)
            .await?
            .unwrap_or_default();

        let lower = match &totals.cursor {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        let batch: Vec<(String, ContentMappingEntry)> = mapping
            .entries
            .range::<String, _>((lower, Bound::Unbounded))
            .take(limit.max(1))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, entry) in &batch {
            self.memoize_metadata(&mut totals, entry).await?;
            totals.fold(entry);
            totals.cursor = Some(key.clone());
        }

        if !batch.is_empty() {
            save(self.store, Region::Aggregates, AGGREGATES_KEY, &totals).await?;
        }

        // Drop everything already folded, including leftovers from an
        // earlier batch whose cleanup write did not land.
        if let Some(cursor) = &totals.cursor {
            let pending = mapping.entries.split_off(&successor(cursor));
            let dropped = mapping.entries.len();
            mapping.entries = pending;
            if dropped > 0 {
                save(self.store, Region::Mapping, MAPPING_KEY, &mapping).await?;
            }
        }

        let remaining = mapping.entries.len();
        debug!(
            folded = batch.len(),
            remaining,
            system_total = totals.system.total,
            "aggregated content batch"
        );

        state.cursor = match &totals.cursor {
            Some(key) => Cursor::Content(key.clone()),
            None => Cursor::Start,
        };
        state.step = totals.folded;

        Ok(AggregationStep {
            state,
            folded: batch.len(),
            remaining,
        })
    }

    async fn memoize_metadata(
        &self,
        totals: &mut AggregateCheckpoint,
        entry: &ContentMappingEntry,
    ) -> Result<()> {
        for id in &entry.courses {
            if totals.courses.contains_key(id) {
                continue;
            }
            let (shortname, category) = match self.lookup.by_course(*id) {
                Some(info) => (info.shortname.clone(), info.category_id),
                None => (String::new(), 0),
            };
            totals.courses.insert(
                *id,
                CourseUsage {
                    id: *id,
                    shortname,
                    category,
                    usage: EntityAggregate::default(),
                },
            );
        }

        for id in &entry.categories {
            if totals.categories.contains_key(id) {
                continue;
            }
            let name = self.facts.category_name(*id).await?.unwrap_or_default();
            totals.categories.insert(
                *id,
                CategoryUsage {
                    id: *id,
                    name,
                    usage: EntityAggregate::default(),
                },
            );
        }
        Ok(())
    }
}

/// Smallest string strictly greater than `key`.
fn successor(key: &str) -> String {
    let mut next = String::with_capacity(key.len() + 1);
    next.push_str(key);
    next.push('\0');
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemoryCheckpointStore, InMemoryFactSource};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn entry(
        size: u64,
        users: &[i64],
        courses: &[i64],
        categories: &[i64],
        other: &[i64],
    ) -> ContentMappingEntry {
        ContentMappingEntry {
            byte_size: size,
            is_backup: false,
            users: users.iter().copied().collect::<BTreeSet<_>>(),
            courses: courses.iter().copied().collect(),
            categories: categories.iter().copied().collect(),
            other: other.iter().copied().collect(),
        }
    }

    #[test]
    fn sole_user_gets_unique() {
        let mut totals = AggregateCheckpoint::default();
        totals.fold(&entry(100, &[7], &[], &[], &[]));
        assert_eq!(totals.users[&7].unique, 100);
        assert_eq!(totals.users[&7].total, 100);
    }

    #[test]
    fn user_and_course_share_no_unique() {
        let mut totals = AggregateCheckpoint::default();
        totals.fold(&entry(100, &[7], &[5], &[2], &[]));
        assert_eq!(totals.users[&7].unique, 0);
        assert_eq!(totals.courses[&5].usage.unique, 0);
        assert_eq!(totals.categories[&2].usage.unique, 0);
        assert_eq!(totals.courses[&5].usage.total, 100);
    }

    #[test]
    fn course_with_own_category_is_unique() {
        let mut totals = AggregateCheckpoint::default();
        totals.fold(&entry(100, &[], &[5], &[2], &[]));
        assert_eq!(totals.courses[&5].usage.unique, 100);
        assert_eq!(totals.categories[&2].usage.unique, 100);
    }

    #[test]
    fn two_courses_in_one_category() {
        let mut totals = AggregateCheckpoint::default();
        totals.fold(&entry(100, &[], &[5, 6], &[2], &[]));
        assert_eq!(totals.courses[&5].usage.unique, 0);
        assert_eq!(totals.courses[&6].usage.unique, 0);
        // Category uniqueness only looks at the category set.
        assert_eq!(totals.categories[&2].usage.unique, 100);
    }

    #[test]
    fn two_categories_share_no_unique() {
        let mut totals = AggregateCheckpoint::default();
        totals.fold(&entry(100, &[], &[5, 6], &[2, 3], &[]));
        assert_eq!(totals.categories[&2].usage.unique, 0);
        assert_eq!(totals.categories[&3].usage.unique, 0);
    }

    #[test]
    fn other_owner_blocks_every_unique() {
        let mut totals = AggregateCheckpoint::default();
        totals.fold(&entry(100, &[7], &[], &[], &[0]));
        totals.fold(&entry(50, &[], &[5], &[2], &[0]));
        assert_eq!(totals.users[&7].unique, 0);
        assert_eq!(totals.courses[&5].usage.unique, 0);
        assert_eq!(totals.categories[&2].usage.unique, 0);
    }

    #[test]
    fn system_counts_once_per_content() {
        let mut totals = AggregateCheckpoint::default();
        totals.fold(&entry(1000, &[7, 8], &[5], &[2], &[]));
        assert_eq!(totals.system.total, 1000);
        assert_eq!(totals.users[&7].total, 1000);
        assert_eq!(totals.users[&8].total, 1000);
    }

    #[test]
    fn backup_bytes_follow_flag() {
        let mut totals = AggregateCheckpoint::default();
        let mut e = entry(300, &[7], &[], &[], &[]);
        e.is_backup = true;
        totals.fold(&e);
        assert_eq!(totals.users[&7].backup, 300);
        assert_eq!(totals.system.backup, 300);
    }

    #[test]
    fn successor_orders_after_key() {
        assert!(successor("h1").as_str() > "h1");
        assert!(successor("h1").as_str() < "h10");
        assert!(successor("h1").as_str() < "h2");
    }

    async fn seed_mapping(store: &InMemoryCheckpointStore, keys: &[&str]) {
        let mut mapping = MappingCheckpoint::default();
        for (i, key) in keys.iter().enumerate() {
            mapping
                .entries
                .insert(key.to_string(), entry(10 * (i as u64 + 1), &[i as i64], &[], &[], &[]));
        }
        save(store, Region::Mapping, MAPPING_KEY, &mapping)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn advance_consumes_each_entry_once() {
        let facts = InMemoryFactSource::new();
        let store = InMemoryCheckpointStore::new();
        let lookup = CourseLookup::new();
        seed_mapping(&store, &["a", "b", "c"]).await;

        let acc = AggregationAccumulator::new(&facts, &store, &lookup);
        let step = acc
            .advance(PipelineState::new(3, Utc::now()), 2)
            .await
            .unwrap();
        assert_eq!(step.folded, 2);
        assert_eq!(step.remaining, 1);
        assert_eq!(step.state.cursor, Cursor::Content("b".into()));

        let step = acc.advance(step.state, 2).await.unwrap();
        assert_eq!(step.folded, 1);
        assert_eq!(step.remaining, 0);
        assert_eq!(step.state.step, 3);

        let step = acc.advance(step.state, 2).await.unwrap();
        assert_eq!(step.folded, 0);
        assert_eq!(step.remaining, 0);

        let totals: AggregateCheckpoint = load(&store, Region::Aggregates, AGGREGATES_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(totals.system.total, 60);
        assert_eq!(totals.folded, 3);
    }

    #[tokio::test]
    async fn advance_skips_entries_left_behind_by_failed_cleanup() {
        let facts = InMemoryFactSource::new();
        let store = InMemoryCheckpointStore::new();
        let lookup = CourseLookup::new();
        seed_mapping(&store, &["a", "b", "c"]).await;

        // Totals already cover "a" and "b", but the mapping still lists them.
        let mut totals = AggregateCheckpoint::default();
        totals.fold(&entry(10, &[0], &[], &[], &[]));
        totals.fold(&entry(20, &[1], &[], &[], &[]));
        totals.cursor = Some("b".into());
        save(&store, Region::Aggregates, AGGREGATES_KEY, &totals)
            .await
            .unwrap();

        let acc = AggregationAccumulator::new(&facts, &store, &lookup);
        let step = acc
            .advance(PipelineState::new(3, Utc::now()), 10)
            .await
            .unwrap();
        assert_eq!(step.folded, 1);
        assert_eq!(step.remaining, 0);

        let totals: AggregateCheckpoint = load(&store, Region::Aggregates, AGGREGATES_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(totals.system.total, 60);
        assert_eq!(totals.users[&0].total, 10);
    }

    #[tokio::test]
    async fn memoizes_course_and_category_metadata() {
        let facts = InMemoryFactSource::new();
        facts.add_course(15, 5, 2, "BIO101");
        facts.add_category(2, 0, "Science");
        let store = InMemoryCheckpointStore::new();
        let lookup = facts.course_lookup().await.unwrap();

        let mut mapping = MappingCheckpoint::default();
        mapping.entries.insert("h".into(), entry(10, &[], &[5], &[2], &[]));
        mapping.entries.insert("i".into(), entry(20, &[], &[], &[9], &[]));
        save(&store, Region::Mapping, MAPPING_KEY, &mapping)
            .await
            .unwrap();

        let acc = AggregationAccumulator::new(&facts, &store, &lookup);
        acc.advance(PipelineState::new(2, Utc::now()), 10)
            .await
            .unwrap();

        let totals: AggregateCheckpoint = load(&store, Region::Aggregates, AGGREGATES_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(totals.courses[&5].shortname, "BIO101");
        assert_eq!(totals.courses[&5].category, 2);
        assert_eq!(totals.categories[&2].name, "Science");
        assert_eq!(totals.categories[&9].name, "");
    }
}
