//! Content mapping: content hash → deduplicated owner sets.
//!
//! The builder scans the fact source in bounded batches past a
//! high-water-mark cursor over record ids. The cursor and the mapping are
//! stored together as one value in [`Region::Mapping`], so a single atomic
//! write both grows the mapping and advances the cursor. A batch that fails
//! before that write is simply re-read next time.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ContentMappingEntry, ContentRecord, CourseLookup, Cursor, PipelineState};
use crate::resolver::{classify, Owner};
use crate::store::{load, save, CheckpointStore, FactSource, Region};

/// Key of the mapping value inside [`Region::Mapping`].
pub const MAPPING_KEY: &str = "mapping";

/// Durable form of the content mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingCheckpoint {
    /// Highest record id already folded into `entries`.
    pub cursor: i64,
    /// Number of records folded so far.
    #[serde(default)]
    pub mapped: u64,
    pub entries: BTreeMap<String, ContentMappingEntry>,
}

impl MappingCheckpoint {
    /// Fold one record into the mapping and advance the cursor.
    ///
    /// Records at or below the cursor are ignored; returns whether the
    /// record was applied.
    pub fn apply(&mut self, record: &ContentRecord, owner: Owner) -> bool {
        if record.id <= self.cursor {
            return false;
        }

        let entry = self
            .entries
            .entry(record.content_hash.clone())
            .or_insert_with(|| ContentMappingEntry::new(record.byte_size, record.is_backup));
        entry.is_backup |= record.is_backup;

        match owner {
            Owner::User(id) => {
                entry.users.insert(id);
            }
            Owner::Course { course, category } => {
                entry.courses.insert(course);
                entry.categories.insert(category);
            }
            Owner::Category(id) => {
                entry.categories.insert(id);
            }
            Owner::Other(id) => {
                entry.other.insert(id);
            }
        }

        self.cursor = record.id;
        self.mapped += 1;
        true
    }
}

/// Outcome of one mapping batch.
#[derive(Debug, Clone)]
pub struct MappingStep {
    pub state: PipelineState,
    /// Records folded in this batch; zero means the fact source is exhausted.
    pub processed: usize,
    /// Distinct content entries in the mapping after this batch.
    pub entries: usize,
}

/// Scans the fact source and extends the durable content mapping.
pub struct ContentMappingBuilder<'a> {
    facts: &'a dyn FactSource,
    store: &'a dyn CheckpointStore,
    lookup: &'a CourseLookup,
}

impl<'a> ContentMappingBuilder<'a> {
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

    /// Map up to `limit` records past the persisted cursor.
    ///
    /// The mapping and cursor are persisted before returning. The returned
    /// state carries the new cursor and step count; persisting it is the
    /// caller's job.
    pub async fn advance(&self, mut state: PipelineState, limit: usize) -> Result<MappingStep> {
        let mut checkpoint: MappingCheckpoint = load(self.store, Region::Mapping, MAPPING_KEY)
            .await?
            .unwrap_or_default();

        let records = self
            .facts
            .fetch_records(checkpoint.cursor, limit.max(1))
            .await?;

        let mut processed = 0usize;
        for record in &records {
            let owner = classify(record, self.lookup);
            if checkpoint.apply(record, owner) {
                processed += 1;
            }
        }

        if processed > 0 {
            save(self.store, Region::Mapping, MAPPING_KEY, &checkpoint).await?;
        }

        debug!(
            processed,
            cursor = checkpoint.cursor,
            entries = checkpoint.entries.len(),
            "mapped content batch"
        );

        state.cursor = Cursor::Record(checkpoint.cursor);
        state.step = checkpoint.mapped;

        Ok(MappingStep {
            state,
            processed,
            entries: checkpoint.entries.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextKind;
    use crate::store::memory::{record, InMemoryCheckpointStore, InMemoryFactSource};
    use chrono::Utc;

    fn facts() -> InMemoryFactSource {
        let facts = InMemoryFactSource::new();
        facts.add_course(15, 5, 2, "BIO101");
        facts.add_record(record(1, "h1", 1000, ContextKind::User, "/1/20", 7));
        facts.add_record(record(2, "h1", 1000, ContextKind::User, "/1/21", 8));
        facts.add_record(record(3, "h1", 1000, ContextKind::User, "/1/20", 7));
        facts.add_record(record(4, "h2", 500, ContextKind::Other, "/1/3/15/27", 300));
        facts.add_record(record(5, "h3", 10, ContextKind::Other, "/1/99", 301));
        facts
    }

    async fn load_mapping(store: &InMemoryCheckpointStore) -> MappingCheckpoint {
        load(store, Region::Mapping, MAPPING_KEY)
            .await
            .unwrap()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn deduplicates_owners_per_content() {
        let facts = facts();
        let store = InMemoryCheckpointStore::new();
        let lookup = facts.course_lookup().await.unwrap();
        let builder = ContentMappingBuilder::new(&facts, &store, &lookup);

        let step = builder
            .advance(PipelineState::new(5, Utc::now()), 100)
            .await
            .unwrap();
        assert_eq!(step.processed, 5);
        assert_eq!(step.entries, 3);

        let mapping = load_mapping(&store).await;
        let h1 = &mapping.entries["h1"];
        assert_eq!(h1.users.len(), 2);
        assert_eq!(h1.byte_size, 1000);

        let h2 = &mapping.entries["h2"];
        assert!(h2.courses.contains(&5));
        assert!(h2.categories.contains(&2));
        assert!(h2.users.is_empty());

        let h3 = &mapping.entries["h3"];
        assert!(h3.other.contains(&301));
    }

    #[tokio::test]
    async fn advances_in_bounded_batches() {
        let facts = facts();
        let store = InMemoryCheckpointStore::new();
        let lookup = facts.course_lookup().await.unwrap();
        let builder = ContentMappingBuilder::new(&facts, &store, &lookup);

        let mut state = PipelineState::new(5, Utc::now());
        let mut batches = Vec::new();
        loop {
            let step = builder.advance(state, 2).await.unwrap();
            state = step.state;
            if step.processed == 0 {
                break;
            }
            batches.push(step.processed);
        }
        assert_eq!(batches, vec![2, 2, 1]);
        assert_eq!(state.step, 5);
        assert_eq!(state.cursor, Cursor::Record(5));
    }

    #[tokio::test]
    async fn cursor_is_monotonic_and_new_rows_are_picked_up() {
        let facts = facts();
        let store = InMemoryCheckpointStore::new();
        let lookup = facts.course_lookup().await.unwrap();
        let builder = ContentMappingBuilder::new(&facts, &store, &lookup);

        let step = builder
            .advance(PipelineState::new(5, Utc::now()), 3)
            .await
            .unwrap();
        assert_eq!(load_mapping(&store).await.cursor, 3);

        facts.add_record(record(6, "h4", 1, ContextKind::User, "/1/22", 9));
        let step = builder.advance(step.state, 100).await.unwrap();
        assert_eq!(step.processed, 3);
        assert_eq!(load_mapping(&store).await.cursor, 6);

        let step = builder.advance(step.state, 100).await.unwrap();
        assert_eq!(step.processed, 0);
        assert_eq!(load_mapping(&store).await.cursor, 6);
    }

    #[test]
    fn apply_is_idempotent_per_record() {
        let lookup = CourseLookup::new();
        let mut once = MappingCheckpoint::default();
        let rec = record(1, "h1", 10, ContextKind::User, "/1/20", 7);
        assert!(once.apply(&rec, classify(&rec, &lookup)));

        let mut twice = once.clone();
        assert!(!twice.apply(&rec, classify(&rec, &lookup)));
        assert_eq!(once, twice);
    }

    #[test]
    fn backup_flag_sticks() {
        let lookup = CourseLookup::new();
        let mut mapping = MappingCheckpoint::default();
        let plain = record(1, "h1", 10, ContextKind::User, "/1/20", 7);
        let mut backup = record(2, "h1", 10, ContextKind::User, "/1/21", 8);
        backup.is_backup = true;
        mapping.apply(&plain, classify(&plain, &lookup));
        mapping.apply(&backup, classify(&backup, &lookup));
        assert!(mapping.entries["h1"].is_backup);
    }
}
