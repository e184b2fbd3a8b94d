//! Pipeline controller: the resumable three-stage state machine.
//!
//! ```text
//! MappingContent ──(fact source exhausted)──▶ Aggregating
//!      ▲                                          │
//!      │                               (mapping drained)
//!  (no state)                                     ▼
//!      └──────────(snapshot published)──── Finalizing
//! ```
//!
//! Each call to [`Pipeline::run_one_step`] does one bounded slice of work
//! in the current stage, persists the resulting [`PipelineState`], and
//! returns. An external scheduler calls it again until the cycle reports
//! completion. A call that fails before persisting is simply repeated.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::aggregate::{AggregateCheckpoint, AggregationAccumulator, AGGREGATES_KEY};
use crate::mapping::ContentMappingBuilder;
use crate::models::{Cursor, PipelineState, Progress, ResultSnapshot, Stage};
use crate::results::{bytes_to_megabytes, ResultStore};
use crate::store::{load, save, CheckpointStore, FactSource, Region};

/// Key of the pipeline state inside [`Region::Progress`].
pub const STATE_KEY: &str = "state";

/// Default number of records or entries handled per invocation.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default age after which a published snapshot is considered stale.
pub const DEFAULT_STALENESS_HOURS: i64 = 24;

/// Tuning knobs for a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub staleness: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            staleness: Duration::hours(DEFAULT_STALENESS_HOURS),
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// More work remains; progress after this step.
    Continue(Progress),
    /// The cycle finished and this snapshot was published.
    Complete(Box<ResultSnapshot>),
}

/// What one invocation did.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Stage that ran during this invocation.
    pub stage: Stage,
    /// Records or entries handled during this invocation.
    pub handled: usize,
    pub outcome: StepOutcome,
}

impl StepReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, StepOutcome::Complete(_))
    }
}

/// Orchestrates mapping, aggregation, and publication across invocations.
pub struct Pipeline {
    facts: Arc<dyn FactSource>,
    store: Arc<dyn CheckpointStore>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        facts: Arc<dyn FactSource>,
        store: Arc<dyn CheckpointStore>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            facts,
            store,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn results(&self) -> ResultStore {
        ResultStore::new(self.store.clone())
    }

    /// Run one bounded invocation of the current stage.
    pub async fn run_one_step(&self) -> Result<StepReport> {
        self.run_one_step_at(Utc::now()).await
    }

    /// [`run_one_step`](Self::run_one_step) with an explicit clock.
    pub async fn run_one_step_at(&self, now: DateTime<Utc>) -> Result<StepReport> {
        let state = match self.load_state().await? {
            Some(state) => state,
            None => self.start_cycle(now).await?,
        };

        match state.stage {
            Stage::MappingContent => self.map_content(state).await,
            Stage::Aggregating => self.aggregate(state).await,
            Stage::Finalizing => self.finalize(now).await,
        }
    }

    /// Progress of the running cycle, if one exists.
    pub async fn get_progress(&self) -> Result<Option<Progress>> {
        Ok(self.load_state().await?.map(|s| s.progress()))
    }

    /// True when no snapshot is published or the last one is stale.
    pub async fn needs_refresh(&self, now: DateTime<Utc>) -> Result<bool> {
        self.results().is_stale(now, self.options.staleness).await
    }

    /// Delete all state in `regions`; every region when `regions` is empty.
    pub async fn purge(&self, regions: &[Region]) -> Result<()> {
        let regions: &[Region] = if regions.is_empty() {
            &Region::ALL
        } else {
            regions
        };
        for region in regions {
            self.store.purge(*region).await?;
            info!(region = %region, "purged region");
        }
        Ok(())
    }

    async fn load_state(&self) -> Result<Option<PipelineState>> {
        load(self.store.as_ref(), Region::Progress, STATE_KEY).await
    }

    async fn save_state(&self, state: &PipelineState) -> Result<()> {
        save(self.store.as_ref(), Region::Progress, STATE_KEY, state).await
    }

    async fn start_cycle(&self, now: DateTime<Utc>) -> Result<PipelineState> {
        // Leftovers from a cycle whose state was purged by hand.
        self.store.purge(Region::Mapping).await?;
        self.store.purge(Region::Aggregates).await?;

        let total = self.facts.count_records().await?;
        let state = PipelineState::new(total, now);
        self.save_state(&state).await?;
        info!(records = total, "starting storage rollup cycle");
        Ok(state)
    }

    async fn map_content(&self, state: PipelineState) -> Result<StepReport> {
        let lookup = self.facts.course_lookup().await?;
        let builder = ContentMappingBuilder::new(self.facts.as_ref(), self.store.as_ref(), &lookup);
        let step = builder.advance(state, self.options.batch_size).await?;

        let mut state = step.state;
        if step.processed == 0 {
            info!(
                records = state.step,
                entries = step.entries,
                "content mapping complete"
            );
            state.stage = Stage::Aggregating;
            state.cursor = Cursor::Start;
            state.step = 0;
            state.step_total = step.entries as u64;
        }
        self.save_state(&state).await?;

        Ok(StepReport {
            stage: Stage::MappingContent,
            handled: step.processed,
            outcome: StepOutcome::Continue(state.progress()),
        })
    }

    async fn aggregate(&self, state: PipelineState) -> Result<StepReport> {
        let lookup = self.facts.course_lookup().await?;
        let accumulator =
            AggregationAccumulator::new(self.facts.as_ref(), self.store.as_ref(), &lookup);
        let step = accumulator.advance(state, self.options.batch_size).await?;

        let mut state = step.state;
        if step.remaining == 0 {
            info!(entries = state.step, "aggregation complete");
            state.stage = Stage::Finalizing;
            state.step_total = state.step;
        }
        self.save_state(&state).await?;

        Ok(StepReport {
            stage: Stage::Aggregating,
            handled: step.folded,
            outcome: StepOutcome::Continue(state.progress()),
        })
    }

    async fn finalize(&self, now: DateTime<Utc>) -> Result<StepReport> {
        let totals: AggregateCheckpoint =
            load(self.store.as_ref(), Region::Aggregates, AGGREGATES_KEY)
                .await?
                .unwrap_or_default();

        let site_bytes = self
            .facts
            .site_usage_bytes()
            .await?
            .unwrap_or(totals.system.total);

        let snapshot = ResultSnapshot {
            published_at: now,
            total_site_megabytes: bytes_to_megabytes(site_bytes),
            system: totals.system,
            courses: totals.courses,
            categories: totals.categories,
            users: totals.users,
        };

        // The state goes before the totals it points at. Failing before the
        // delete republishes the same totals; failing after it leaves
        // leftovers that the next `start_cycle` purges.
        self.results().publish(&snapshot).await?;
        self.store.delete(Region::Progress, STATE_KEY).await?;
        self.store.purge(Region::Mapping).await?;
        self.store.purge(Region::Aggregates).await?;
        info!("storage rollup cycle complete");

        Ok(StepReport {
            stage: Stage::Finalizing,
            handled: 0,
            outcome: StepOutcome::Complete(Box::new(snapshot)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MappingCheckpoint, MAPPING_KEY};
    use crate::models::ContextKind;
    use crate::store::memory::{record, InMemoryCheckpointStore, InMemoryFactSource};
    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every mutation (`set`, `delete`, `purge`) once the budget is spent.
    struct FlakyStore {
        inner: InMemoryCheckpointStore,
        writes_left: AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryCheckpointStore::new(),
                writes_left: AtomicUsize::new(usize::MAX),
            }
        }

        fn allow_writes(&self, n: usize) {
            self.writes_left.store(n, Ordering::SeqCst);
        }

        fn spend(&self) -> Result<()> {
            let left = self.writes_left.load(Ordering::SeqCst);
            if left == 0 {
                bail!("checkpoint store unavailable");
            }
            self.writes_left.store(left - 1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl CheckpointStore for FlakyStore {
        async fn get(&self, region: Region, key: &str) -> Result<Option<Value>> {
            self.inner.get(region, key).await
        }

        async fn set(&self, region: Region, key: &str, value: Value) -> Result<()> {
            self.spend()?;
            self.inner.set(region, key, value).await
        }

        async fn delete(&self, region: Region, key: &str) -> Result<()> {
            self.spend()?;
            self.inner.delete(region, key).await
        }

        async fn purge(&self, region: Region) -> Result<()> {
            self.spend()?;
            self.inner.purge(region).await
        }
    }

    fn scenario_facts() -> InMemoryFactSource {
        let facts = InMemoryFactSource::new();
        facts.add_category(2, 0, "Science");
        facts.add_course(15, 5, 2, "BIO101");
        facts.add_record(record(1, "h1", 1000, ContextKind::User, "/1/20", 7));
        facts.add_record(record(2, "h1", 1000, ContextKind::Course, "/1/3/15", 5));
        let mut backup = record(3, "h2", 500, ContextKind::User, "/1/20", 7);
        backup.is_backup = true;
        facts.add_record(backup);
        facts
    }

    fn options(batch_size: usize) -> PipelineOptions {
        PipelineOptions {
            batch_size,
            ..Default::default()
        }
    }

    async fn run_to_completion(pipeline: &Pipeline) -> (ResultSnapshot, usize) {
        for steps in 1..=1000 {
            let report = pipeline.run_one_step().await.unwrap();
            if let StepOutcome::Complete(snapshot) = report.outcome {
                return (*snapshot, steps);
            }
        }
        panic!("pipeline did not complete");
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let pipeline = Pipeline::new(Arc::new(scenario_facts()), store.clone(), options(100));

        let (snapshot, _) = run_to_completion(&pipeline).await;

        let user = snapshot.users[&7];
        assert_eq!(user.total, 1500);
        assert_eq!(user.unique, 500);
        assert_eq!(user.backup, 500);

        let course = &snapshot.courses[&5];
        assert_eq!(course.usage.total, 1000);
        assert_eq!(course.usage.unique, 0);
        assert_eq!(course.shortname, "BIO101");
        assert_eq!(snapshot.categories[&2].name, "Science");

        assert_eq!(snapshot.system.total, 1500);
        assert_eq!(snapshot.total_site_megabytes, 1);

        // Intermediate state is gone; only the published result remains.
        assert!(store.keys(Region::Progress).is_empty());
        assert!(store.keys(Region::Mapping).is_empty());
        assert!(store.keys(Region::Aggregates).is_empty());
        assert_eq!(pipeline.results().latest().await.unwrap(), Some(snapshot));
        assert!(pipeline.get_progress().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stage_transitions_with_small_batches() {
        let pipeline = Pipeline::new(
            Arc::new(scenario_facts()),
            Arc::new(InMemoryCheckpointStore::new()),
            options(2),
        );

        let mut stages = Vec::new();
        loop {
            let report = pipeline.run_one_step().await.unwrap();
            stages.push((report.stage, report.handled));
            if report.is_complete() {
                break;
            }
        }
        assert_eq!(
            stages,
            vec![
                (Stage::MappingContent, 2),
                (Stage::MappingContent, 1),
                (Stage::MappingContent, 0),
                (Stage::Aggregating, 2),
                (Stage::Finalizing, 0),
            ]
        );
    }

    #[tokio::test]
    async fn progress_reports_stage_and_percent() {
        let pipeline = Pipeline::new(
            Arc::new(scenario_facts()),
            Arc::new(InMemoryCheckpointStore::new()),
            options(1),
        );
        assert!(pipeline.get_progress().await.unwrap().is_none());

        pipeline.run_one_step().await.unwrap();
        let progress = pipeline.get_progress().await.unwrap().unwrap();
        assert_eq!(progress.stage, Stage::MappingContent);
        assert_eq!(progress.step, 1);
        assert_eq!(progress.step_total, 3);
        assert_eq!(progress.percent, Some(33));
    }

    #[tokio::test]
    async fn empty_inventory_publishes_empty_snapshot() {
        let pipeline = Pipeline::new(
            Arc::new(InMemoryFactSource::new()),
            Arc::new(InMemoryCheckpointStore::new()),
            options(10),
        );
        let (snapshot, steps) = run_to_completion(&pipeline).await;
        assert_eq!(steps, 3);
        assert_eq!(snapshot.system.total, 0);
        assert!(snapshot.users.is_empty());
    }

    #[tokio::test]
    async fn site_usage_overrides_system_total_for_megabytes() {
        let facts = scenario_facts();
        facts.set_site_usage_bytes(Some(5 * 1_048_576 + 1));
        let pipeline = Pipeline::new(
            Arc::new(facts),
            Arc::new(InMemoryCheckpointStore::new()),
            options(100),
        );
        let (snapshot, _) = run_to_completion(&pipeline).await;
        assert_eq!(snapshot.total_site_megabytes, 6);
        assert_eq!(snapshot.system.total, 1500);
    }

    #[tokio::test]
    async fn failed_writes_repeat_work_without_double_counting() {
        let store = Arc::new(FlakyStore::new());
        let pipeline = Pipeline::new(Arc::new(scenario_facts()), store.clone(), options(1));

        // Cycle the budget from zero to four mutations so interruptions land
        // between every pair of sets, deletes and purges. Finalizing needs
        // four, the most of any step.
        let mut snapshot = None;
        for round in 0..400 {
            store.allow_writes(round % 5);
            match pipeline.run_one_step().await {
                Ok(report) => {
                    if let StepOutcome::Complete(s) = report.outcome {
                        snapshot = Some(*s);
                        break;
                    }
                }
                Err(_) => continue,
            }
        }
        store.allow_writes(usize::MAX);
        let snapshot = match snapshot {
            Some(s) => s,
            None => run_to_completion(&pipeline).await.0,
        };

        assert_eq!(snapshot.users[&7].total, 1500);
        assert_eq!(snapshot.users[&7].unique, 500);
        assert_eq!(snapshot.courses[&5].usage.total, 1000);
        assert_eq!(snapshot.system.total, 1500);
        assert_eq!(pipeline.results().latest().await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn interrupted_finalize_never_publishes_purged_totals() {
        // Finalizing mutates four times: publish, delete state, two purges.
        for budget in 1..4 {
            let store = Arc::new(FlakyStore::new());
            let pipeline = Pipeline::new(Arc::new(scenario_facts()), store.clone(), options(100));
            for _ in 0..3 {
                pipeline.run_one_step().await.unwrap();
            }
            assert_eq!(
                pipeline.get_progress().await.unwrap().unwrap().stage,
                Stage::Finalizing
            );

            store.allow_writes(budget);
            assert!(pipeline.run_one_step().await.is_err());
            let published = pipeline.results().latest().await.unwrap().unwrap();
            assert_eq!(published.system.total, 1500);

            // Whatever the next call does, the published totals stay right.
            store.allow_writes(usize::MAX);
            let report = pipeline.run_one_step().await.unwrap();
            let latest = pipeline.results().latest().await.unwrap().unwrap();
            assert_eq!(latest.system.total, 1500, "budget {}", budget);
            assert_eq!(latest.users[&7].total, 1500, "budget {}", budget);

            if !report.is_complete() {
                let (snapshot, _) = run_to_completion(&pipeline).await;
                assert_eq!(snapshot.system.total, 1500);
                assert_eq!(snapshot.users[&7].unique, 500);
            }
            assert!(store.inner.keys(Region::Aggregates).is_empty());
        }
    }

    #[tokio::test]
    async fn interrupted_mapping_step_is_replayed_idempotently() {
        let store = Arc::new(FlakyStore::new());
        let pipeline = Pipeline::new(Arc::new(scenario_facts()), store.clone(), options(2));

        // Cycle start (two purges, initial state) and the mapping write land;
        // the state update fails.
        store.allow_writes(4);
        assert!(pipeline.run_one_step().await.is_err());
        let mapping: MappingCheckpoint = load(store.as_ref(), Region::Mapping, MAPPING_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.cursor, 2);

        store.allow_writes(usize::MAX);
        let report = pipeline.run_one_step().await.unwrap();
        assert_eq!(report.handled, 1);
        let progress = pipeline.get_progress().await.unwrap().unwrap();
        assert_eq!(progress.step, 3);

        let (snapshot, _) = run_to_completion(&pipeline).await;
        assert_eq!(snapshot.system.total, 1500);
        assert_eq!(snapshot.users[&7].total, 1500);
    }

    #[tokio::test]
    async fn needs_refresh_tracks_staleness() {
        let pipeline = Pipeline::new(
            Arc::new(scenario_facts()),
            Arc::new(InMemoryCheckpointStore::new()),
            PipelineOptions {
                batch_size: 100,
                staleness: Duration::hours(6),
            },
        );
        let now = Utc::now();
        assert!(pipeline.needs_refresh(now).await.unwrap());

        for _ in 0..3 {
            pipeline.run_one_step_at(now).await.unwrap();
        }
        assert!(pipeline.run_one_step_at(now).await.unwrap().is_complete());
        assert!(!pipeline.needs_refresh(now).await.unwrap());
        assert!(pipeline
            .needs_refresh(now + Duration::hours(7))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn purge_clears_requested_regions() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let pipeline = Pipeline::new(Arc::new(scenario_facts()), store.clone(), options(1));
        pipeline.run_one_step().await.unwrap();
        assert!(!store.keys(Region::Mapping).is_empty());

        pipeline.purge(&[Region::Mapping]).await.unwrap();
        assert!(store.keys(Region::Mapping).is_empty());
        assert!(!store.keys(Region::Progress).is_empty());

        pipeline.purge(&[]).await.unwrap();
        assert!(store.keys(Region::Progress).is_empty());
    }
}
