//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;
use tracing::info;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "pipeline_state",
        sql: r#"
            CREATE TABLE IF NOT EXISTS pipeline_state (
                thread_id TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                triggered_by TEXT NOT NULL DEFAULT 'user',
                transitioned_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pipeline_state_stage ON pipeline_state(stage);
        "#,
    },
    Migration {
        version: 2,
        name: "pipeline_transitions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS pipeline_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                from_stage TEXT,
                to_stage TEXT NOT NULL,
                triggered_by TEXT NOT NULL,
                transitioned_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pipeline_transitions_thread
                ON pipeline_transitions(thread_id);
        "#,
    },
];

/// Create the `_migrations` table and apply pending migrations.
pub async fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    run_migrations(conn).await
}

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("create _migrations: {e}")))?;

    let current = get_current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                StoreError::Migration(format!("V{} {}: {e}", migration.version, migration.name))
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| StoreError::Migration(format!("record V{}: {e}", migration.version)))?;

        info!(version = migration.version, name = migration.name, "Applied migration");
    }

    Ok(())
}

/// Highest applied migration version, 0 for a fresh database.
pub async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("read version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
        Ok(None) => Ok(0),
        Err(e) => Err(StoreError::Migration(format!("read version: {e}"))),
    }
}
