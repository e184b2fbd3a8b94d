use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the checkpoint schema and, when `with_facts` is set, an empty
/// file inventory schema.
pub async fn run_migrations(config: &Config, with_facts: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    create_checkpoint_schema(&pool).await?;
    pool.close().await;

    if with_facts {
        let facts = db::connect_facts(config).await?;
        create_fact_schema(&facts).await?;
        facts.close().await;
    }

    Ok(())
}

pub async fn create_checkpoint_schema(pool: &SqlitePool) -> Result<()> {
    // One row per (region, key); values are opaque JSON documents.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            region TEXT NOT NULL,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (region, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_fact_schema(pool: &SqlitePool) -> Result<()> {
    // Create context table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS context (
            id INTEGER PRIMARY KEY,
            contextlevel INTEGER NOT NULL,
            instanceid INTEGER NOT NULL,
            path TEXT NOT NULL DEFAULT '',
            depth INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create files table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY,
            contenthash TEXT NOT NULL,
            filesize INTEGER NOT NULL,
            component TEXT NOT NULL DEFAULT '',
            contextid INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS course (
            id INTEGER PRIMARY KEY,
            category INTEGER NOT NULL,
            shortname TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS course_categories (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            parent INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            firstname TEXT NOT NULL DEFAULT '',
            lastname TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_contextid ON files(contextid)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_context_level_instance ON context(contextlevel, instanceid)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_course_categories_parent ON course_categories(parent)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
