//! Published results.
//!
//! The [`ResultStore`] owns the last complete [`ResultSnapshot`]. A
//! snapshot is written as one value, so readers see either the previous
//! snapshot or the new one.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::models::{EntityAggregate, ResultSnapshot};
use crate::store::{load, save, CheckpointStore, Region};

/// Key of the snapshot inside [`Region::Results`].
pub const SNAPSHOT_KEY: &str = "snapshot";

/// Bytes per reported megabyte.
pub const MEGABYTE: u64 = 1_048_576;

/// `ceil(bytes / 1 MiB)`.
pub fn bytes_to_megabytes(bytes: u64) -> u64 {
    bytes.div_ceil(MEGABYTE)
}

/// Read/write access to the published snapshot.
#[derive(Clone)]
pub struct ResultStore {
    store: Arc<dyn CheckpointStore>,
}

impl ResultStore {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Replace the published snapshot.
    pub async fn publish(&self, snapshot: &ResultSnapshot) -> Result<()> {
        save(self.store.as_ref(), Region::Results, SNAPSHOT_KEY, snapshot).await?;
        info!(
            published_at = %snapshot.published_at,
            courses = snapshot.courses.len(),
            categories = snapshot.categories.len(),
            users = snapshot.users.len(),
            system_total = snapshot.system.total,
            "published storage snapshot"
        );
        Ok(())
    }

    /// The last published snapshot, if any.
    pub async fn latest(&self) -> Result<Option<ResultSnapshot>> {
        load(self.store.as_ref(), Region::Results, SNAPSHOT_KEY).await
    }

    /// True when nothing is published or the snapshot is older than `window`.
    pub async fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> Result<bool> {
        Ok(match self.latest().await? {
            Some(snapshot) => snapshot.published_at < now - window,
            None => true,
        })
    }
}

impl ResultSnapshot {
    /// View restricted to a set of categories.
    ///
    /// Courses are kept when their category is allowed, categories when
    /// they are allowed themselves. Users and system totals are untouched.
    pub fn filter_by_categories(&self, allowed: &[i64]) -> ResultSnapshot {
        let mut view = self.clone();
        view.courses.retain(|_, c| allowed.contains(&c.category));
        view.categories.retain(|id, _| allowed.contains(id));
        view
    }

    /// Users ordered by total bytes, largest first; ties by id.
    pub fn top_users(&self, n: usize) -> Vec<(i64, EntityAggregate)> {
        let mut users: Vec<(i64, EntityAggregate)> =
            self.users.iter().map(|(id, agg)| (*id, *agg)).collect();
        users.sort_by(|a, b| b.1.total.cmp(&a.1.total).then(a.0.cmp(&b.0)));
        users.truncate(n);
        users
    }
}
