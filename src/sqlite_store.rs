//! SQLite-backed [`FactSource`] and [`CheckpointStore`] implementations.
//!
//! The fact source reads the file inventory schema created by
//! [`migrate::create_fact_schema`](crate::migrate::create_fact_schema)
//! (`files`, `context`, `course`, `course_categories`, `users`). The
//! checkpoint store keeps one JSON document per `(region, key)` row in the
//! `checkpoints` table; each `set` is a single upsert and therefore atomic.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use storage_rollup_core::models::{ContentRecord, ContextKind, CourseInfo, CourseLookup};
use storage_rollup_core::store::{CheckpointStore, FactSource, Region};

/// SQLite implementation of the [`FactSource`] trait.
pub struct SqliteFactSource {
    pool: SqlitePool,
    data_root: Option<PathBuf>,
}

impl SqliteFactSource {
    pub fn new(pool: SqlitePool, data_root: Option<PathBuf>) -> Self {
        Self { pool, data_root }
    }
}

#[async_trait]
impl FactSource for SqliteFactSource {
    async fn fetch_records(&self, after_id: i64, limit: usize) -> Result<Vec<ContentRecord>> {
        // Files whose context row is missing still count; they resolve to "other".
        let rows = sqlx::query(
            r#"
            SELECT f.id,
                   f.contenthash,
                   f.filesize,
                   f.component,
                   COALESCE(cx.contextlevel, 0) AS contextlevel,
                   COALESCE(cx.instanceid, 0) AS instanceid,
                   COALESCE(cx.path, '') AS path
            FROM files f
            LEFT JOIN context cx ON cx.id = f.contextid
            WHERE f.id > ?
            ORDER BY f.id ASC
            LIMIT ?
            "#,
        )
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch file records")?;

        Ok(rows
            .iter()
            .map(|row| {
                let component: String = row.get("component");
                let filesize: i64 = row.get("filesize");
                ContentRecord {
                    id: row.get("id"),
                    content_hash: row.get("contenthash"),
                    byte_size: filesize.max(0) as u64,
                    is_backup: component == "backup",
                    context_path: row.get("path"),
                    context_kind: ContextKind::from_level(row.get("contextlevel")),
                    owner_hint: row.get("instanceid"),
                }
            })
            .collect())
    }

    async fn count_records(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn course_lookup(&self) -> Result<CourseLookup> {
        let rows = sqlx::query(
            r#"
            SELECT cx.id AS context_id,
                   c.id AS course_id,
                   c.category,
                   c.shortname
            FROM course c
            JOIN context cx ON cx.instanceid = c.id AND cx.contextlevel = ?
            "#,
        )
        .bind(storage_rollup_core::models::CONTEXT_LEVEL_COURSE)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load course lookup")?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<i64, _>("context_id"),
                    CourseInfo {
                        course_id: row.get("course_id"),
                        category_id: row.get("category"),
                        shortname: row.get("shortname"),
                    },
                )
            })
            .collect())
    }

    async fn category_name(&self, category_id: i64) -> Result<Option<String>> {
        let name: Option<String> =
            sqlx::query_scalar("SELECT name FROM course_categories WHERE id = ?")
                .bind(category_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(name)
    }

    async fn user_name(&self, user_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT firstname, lastname FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            let first: String = r.get("firstname");
            let last: String = r.get("lastname");
            format!("{} {}", first, last).trim().to_string()
        }))
    }

    async fn category_descendants(&self, category_id: i64) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE sub(id) AS (
                SELECT id FROM course_categories WHERE parent = ?
                UNION
                SELECT c.id FROM course_categories c JOIN sub ON c.parent = sub.id
            )
            SELECT id FROM sub ORDER BY id
            "#,
        )
        .bind(category_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn site_usage_bytes(&self) -> Result<Option<u64>> {
        let Some(root) = self.data_root.clone() else {
            return Ok(None);
        };
        let bytes = tokio::task::spawn_blocking(move || directory_size(&root)).await??;
        Ok(Some(bytes))
    }
}

/// Total size of every regular file under `root`.
fn directory_size(root: &std::path::Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// SQLite implementation of the [`CheckpointStore`] trait.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of keys per region, for status output.
    pub async fn key_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT region, COUNT(*) AS n FROM checkpoints GROUP BY region ORDER BY region",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("region"), r.get::<i64, _>("n")))
            .collect())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, region: Region, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT value_json FROM checkpoints WHERE region = ? AND key = ?")
                .bind(region.as_str())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s).with_context(|| {
                format!("Corrupt checkpoint JSON at {}/{}", region, key)
            })?)),
            None => Ok(None),
        }
    }

    async fn set(&self, region: Region, key: &str, value: Value) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoints (region, key, value_json, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(region, key) DO UPDATE SET
                value_json = excluded.value_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(region.as_str())
        .bind(key)
        .bind(serde_json::to_string(&value)?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, region: Region, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE region = ? AND key = ?")
            .bind(region.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge(&self, region: Region) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE region = ?")
            .bind(region.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
