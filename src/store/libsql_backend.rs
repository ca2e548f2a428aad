//! libSQL backend — async `PipelineStore` implementation.
//!
//! Supports local file and in-memory databases. Writes are serialized
//! through a mutex so the upsert and its audit row commit together even
//! when many `set_stage` calls are in flight on the shared connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::pipeline::types::{PipelineRecord, Stage, StageTransition, TriggeredBy};
use crate::store::migrations;
use crate::store::traits::{PipelineStore, validate_thread_id};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Pipeline database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        migrations::init_schema(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_records(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<PipelineRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output, with and without fractional seconds
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, format) {
            return ndt.and_utc();
        }
    }
    warn!(value = s, "Unparseable timestamp in pipeline row, treating as oldest");
    DateTime::<Utc>::MIN_UTC
}

fn parse_stage(s: &str) -> Result<Stage, StoreError> {
    s.parse().map_err(StoreError::Serialization)
}

/// Unknown trigger strings from older rows read back as `user`.
fn parse_trigger(s: &str) -> TriggeredBy {
    s.parse().unwrap_or(TriggeredBy::User)
}

const RECORD_COLUMNS: &str = "thread_id, stage, triggered_by, updated_at";

/// Map a libsql Row to a PipelineRecord. Column order matches RECORD_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<PipelineRecord, StoreError> {
    let get = |idx: i32| {
        row.get::<String>(idx)
            .map_err(|e| StoreError::Serialization(format!("pipeline_state column {idx}: {e}")))
    };
    Ok(PipelineRecord {
        thread_id: get(0)?,
        stage: parse_stage(&get(1)?)?,
        triggered_by: parse_trigger(&get(2)?),
        updated_at: parse_datetime(&get(3)?),
    })
}

fn row_to_transition(row: &libsql::Row) -> Result<StageTransition, StoreError> {
    let text = |idx: i32| {
        row.get::<String>(idx)
            .map_err(|e| StoreError::Serialization(format!("pipeline_transitions column {idx}: {e}")))
    };
    let from_stage = match row.get_value(1) {
        Ok(libsql::Value::Text(s)) => Some(parse_stage(&s)?),
        _ => None,
    };
    Ok(StageTransition {
        thread_id: text(0)?,
        from_stage,
        to_stage: parse_stage(&text(2)?)?,
        triggered_by: parse_trigger(&text(3)?),
        transitioned_at: parse_datetime(&text(4)?),
    })
}

fn opt_stage(stage: Option<Stage>) -> libsql::Value {
    match stage {
        Some(s) => libsql::Value::Text(s.as_str().to_string()),
        None => libsql::Value::Null,
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl PipelineStore for LibSqlBackend {
    async fn get_all(&self) -> Result<Vec<PipelineRecord>, StoreError> {
        self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM pipeline_state ORDER BY thread_id"),
            (),
            "get_all",
        )
        .await
    }

    async fn get_by_stage(&self, stage: Stage) -> Result<Vec<PipelineRecord>, StoreError> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM pipeline_state WHERE stage = ?1 ORDER BY updated_at DESC"
            ),
            params![stage.as_str()],
            "get_by_stage",
        )
        .await
    }

    async fn get(&self, thread_id: &str) -> Result<Option<PipelineRecord>, StoreError> {
        validate_thread_id(thread_id)?;
        let mut records = self
            .query_records(
                &format!("SELECT {RECORD_COLUMNS} FROM pipeline_state WHERE thread_id = ?1"),
                params![thread_id],
                "get",
            )
            .await?;
        Ok(records.pop())
    }

    async fn set_stage(
        &self,
        thread_id: &str,
        stage: Stage,
        triggered_by: TriggeredBy,
    ) -> Result<PipelineRecord, StoreError> {
        validate_thread_id(thread_id)?;

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| StoreError::Unavailable(format!("set_stage begin: {e}")))?;

        let from_stage = {
            let mut rows = tx
                .query(
                    "SELECT stage FROM pipeline_state WHERE thread_id = ?1",
                    params![thread_id],
                )
                .await
                .map_err(|e| StoreError::Query(format!("set_stage read: {e}")))?;
            match rows.next().await {
                Ok(Some(row)) => {
                    let s: String = row
                        .get(0)
                        .map_err(|e| StoreError::Serialization(format!("set_stage read: {e}")))?;
                    Some(parse_stage(&s)?)
                }
                Ok(None) => None,
                Err(e) => return Err(StoreError::Query(format!("set_stage read: {e}"))),
            }
        };

        tx.execute(
            "INSERT INTO pipeline_state (thread_id, stage, triggered_by, transitioned_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (thread_id) DO UPDATE SET stage = ?2, triggered_by = ?3, transitioned_at = ?4, updated_at = ?4",
            params![thread_id, stage.as_str(), triggered_by.as_str(), now_str.clone()],
        )
        .await
        .map_err(|e| StoreError::Query(format!("set_stage upsert: {e}")))?;

        tx.execute(
            "INSERT INTO pipeline_transitions (thread_id, from_stage, to_stage, triggered_by, transitioned_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                thread_id,
                opt_stage(from_stage),
                stage.as_str(),
                triggered_by.as_str(),
                now_str
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("set_stage audit: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("set_stage commit: {e}")))?;

        debug!(thread_id, from = ?from_stage, to = %stage, triggered_by = %triggered_by, "Pipeline stage stored");

        Ok(PipelineRecord {
            thread_id: thread_id.to_string(),
            stage,
            triggered_by,
            updated_at: now,
        })
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError> {
        validate_thread_id(thread_id)?;
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "DELETE FROM pipeline_state WHERE thread_id = ?1",
                params![thread_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_thread: {e}")))?;

        if count > 0 {
            info!(thread_id, "Pipeline record deleted with thread");
        }
        Ok(count > 0)
    }

    async fn transitions(&self, thread_id: &str) -> Result<Vec<StageTransition>, StoreError> {
        validate_thread_id(thread_id)?;
        let mut rows = self
            .conn()
            .query(
                "SELECT thread_id, from_stage, to_stage, triggered_by, transitioned_at
                 FROM pipeline_transitions WHERE thread_id = ?1 ORDER BY id ASC",
                params![thread_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("transitions: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("transitions: {e}")))?
        {
            out.push(row_to_transition(&row)?);
        }
        Ok(out)
    }
}
