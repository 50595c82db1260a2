//! libSQL backend: durable task queue, sync cursors and processing results.
//!
//! One connection is opened per database and shared. The queue, cursor and
//! result handles are thin views over it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{DatabaseError, Error, QueueError};
use crate::ingest::cursor::CursorStore;
use crate::ingest::model::SyncCursor;
use crate::pipeline::types::{Outcome, PipelineOutput, ProcessingResult, ResultSink};
use crate::queue::store::TaskQueue;
use crate::store::migrations;

/// Longest a blocked `pop_head` sleeps before looking at the table again.
/// Covers appends from other processes, which never wake our `Notify`.
const POP_POLL_STEP: Duration = Duration::from_millis(250);

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::migrate(&self.conn).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Durable FIFO named `queue_name`.
    pub fn task_queue(self: &Arc<Self>, queue_name: impl Into<String>) -> LibSqlTaskQueue {
        LibSqlTaskQueue {
            backend: Arc::clone(self),
            name: queue_name.into(),
            arrivals: Notify::new(),
        }
    }

    /// Cursor slot for the source called `source`.
    pub fn cursor_store(self: &Arc<Self>, source: impl Into<String>) -> LibSqlCursorStore {
        LibSqlCursorStore {
            backend: Arc::clone(self),
            source: source.into(),
        }
    }

    /// Fetch one stored result.
    pub async fn get_result(&self, task_id: &str) -> Result<Option<ProcessingResult>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RESULT_COLUMNS} FROM processing_results WHERE task_id = ?1"),
                params![task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_result: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_result(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_result: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const RESULT_COLUMNS: &str = "task_id, worker_id, outcome, attempts, error, output, completed_at";

/// Map a row (in `RESULT_COLUMNS` order) to a [`ProcessingResult`].
fn row_to_result(row: &libsql::Row) -> Result<ProcessingResult, DatabaseError> {
    let field = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let outcome_str: String = row.get(2).map_err(field)?;
    let outcome: Outcome = outcome_str.parse().map_err(DatabaseError::Serialization)?;
    let attempts: i64 = row.get(3).map_err(field)?;
    let output: Option<String> = row.get(5).ok();
    let output = output
        .map(|raw| serde_json::from_str::<PipelineOutput>(&raw))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("result output: {e}")))?;
    let completed: String = row.get(6).map_err(field)?;

    Ok(ProcessingResult {
        task_id: row.get(0).map_err(field)?,
        worker_id: row.get(1).ok(),
        outcome,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        error: row.get(4).ok(),
        output,
        completed_at: parse_datetime(&completed),
    })
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn task_id_of(record: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(record)
        .ok()?
        .get("task_id")?
        .as_str()
        .map(String::from)
}

// ── Task queue ──────────────────────────────────────────────────────

/// Durable FIFO in the `task_queue` table.
///
/// Pop is a single `DELETE … RETURNING` statement, so two consumers can never
/// receive the same record.
pub struct LibSqlTaskQueue {
    backend: Arc<LibSqlBackend>,
    name: String,
    arrivals: Notify,
}

impl LibSqlTaskQueue {
    fn unavailable(&self, op: &str, e: impl std::fmt::Display) -> QueueError {
        QueueError::Unavailable {
            queue: self.name.clone(),
            reason: format!("{op}: {e}"),
        }
    }

    async fn try_pop(&self) -> Result<Option<String>, QueueError> {
        let mut rows = self
            .backend
            .conn()
            .query(
                "DELETE FROM task_queue
                 WHERE seq = (SELECT MIN(seq) FROM task_queue WHERE queue_name = ?1)
                 RETURNING payload",
                params![self.name.as_str()],
            )
            .await
            .map_err(|e| self.unavailable("pop", e))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| self.unavailable("pop", e)),
            Ok(None) => Ok(None),
            Err(e) => Err(self.unavailable("pop", e)),
        }
    }
}

#[async_trait]
impl TaskQueue for LibSqlTaskQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, record: String) -> Result<bool, QueueError> {
        let task_id = task_id_of(&record);
        self.backend
            .conn()
            .execute(
                "INSERT INTO task_queue (queue_name, task_id, payload, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    self.name.as_str(),
                    opt_text(task_id.as_deref()),
                    record,
                    format_datetime(&Utc::now())
                ],
            )
            .await
            .map_err(|e| self.unavailable("append", e))?;
        self.arrivals.notify_one();
        Ok(true)
    }

    async fn pop_head(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.try_pop().await? {
                return Ok(Some(record));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout((deadline - now).min(POP_POLL_STEP), notified).await;
        }
    }

    async fn length(&self) -> Result<usize, QueueError> {
        let mut rows = self
            .backend
            .conn()
            .query(
                "SELECT COUNT(*) FROM task_queue WHERE queue_name = ?1",
                params![self.name.as_str()],
            )
            .await
            .map_err(|e| self.unavailable("length", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(|e| self.unavailable("length", e))?;
                Ok(count.max(0) as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(self.unavailable("length", e)),
        }
    }

    async fn peek(&self, count: usize) -> Result<Vec<String>, QueueError> {
        let mut rows = self
            .backend
            .conn()
            .query(
                "SELECT payload FROM task_queue WHERE queue_name = ?1 ORDER BY seq LIMIT ?2",
                params![self.name.as_str(), count as i64],
            )
            .await
            .map_err(|e| self.unavailable("peek", e))?;

        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(
                    row.get::<String>(0)
                        .map_err(|e| self.unavailable("peek", e))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(self.unavailable("peek", e)),
            }
        }
        Ok(out)
    }

    async fn find(&self, task_id: &str) -> Result<Option<String>, QueueError> {
        let mut rows = self
            .backend
            .conn()
            .query(
                "SELECT payload FROM task_queue
                 WHERE queue_name = ?1 AND task_id = ?2
                 ORDER BY seq LIMIT 1",
                params![self.name.as_str(), task_id],
            )
            .await
            .map_err(|e| self.unavailable("find", e))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| self.unavailable("find", e)),
            Ok(None) => Ok(None),
            Err(e) => Err(self.unavailable("find", e)),
        }
    }

    async fn clear(&self) -> Result<usize, QueueError> {
        let removed = self
            .backend
            .conn()
            .execute(
                "DELETE FROM task_queue WHERE queue_name = ?1",
                params![self.name.as_str()],
            )
            .await
            .map_err(|e| self.unavailable("clear", e))?;
        debug!(queue = %self.name, removed, "Queue cleared");
        Ok(removed as usize)
    }
}

// ── Cursors ─────────────────────────────────────────────────────────

/// One row of `sync_cursors`.
pub struct LibSqlCursorStore {
    backend: Arc<LibSqlBackend>,
    source: String,
}

#[async_trait]
impl CursorStore for LibSqlCursorStore {
    async fn read(&self) -> Result<Option<SyncCursor>, DatabaseError> {
        let mut rows = self
            .backend
            .conn()
            .query(
                "SELECT token, issued_at FROM sync_cursors WHERE source = ?1",
                params![self.source.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("read cursor: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let token: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                let issued: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(SyncCursor {
                    token,
                    issued_at: parse_datetime(&issued),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("read cursor: {e}"))),
        }
    }

    async fn write(&self, cursor: &SyncCursor) -> Result<(), DatabaseError> {
        self.backend
            .conn()
            .execute(
                "INSERT INTO sync_cursors (source, token, issued_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source) DO UPDATE SET
                    token = excluded.token,
                    issued_at = excluded.issued_at,
                    updated_at = excluded.updated_at",
                params![
                    self.source.as_str(),
                    cursor.token.as_str(),
                    format_datetime(&cursor.issued_at),
                    format_datetime(&Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("write cursor: {e}")))?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), DatabaseError> {
        self.backend
            .conn()
            .execute(
                "DELETE FROM sync_cursors WHERE source = ?1",
                params![self.source.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset cursor: {e}")))?;
        Ok(())
    }
}

// ── Results ─────────────────────────────────────────────────────────

#[async_trait]
impl ResultSink for LibSqlBackend {
    /// Upsert by task id: re-processing a task replaces its earlier result.
    async fn record(&self, result: &ProcessingResult) -> Result<(), Error> {
        let output = result
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("result output: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO processing_results
                    (task_id, worker_id, outcome, attempts, error, output, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(task_id) DO UPDATE SET
                    worker_id = excluded.worker_id,
                    outcome = excluded.outcome,
                    attempts = excluded.attempts,
                    error = excluded.error,
                    output = excluded.output,
                    completed_at = excluded.completed_at",
                params![
                    result.task_id.as_str(),
                    opt_text(result.worker_id.as_deref()),
                    result.outcome.as_str(),
                    i64::from(result.attempts),
                    opt_text(result.error.as_deref()),
                    opt_text(output.as_deref()),
                    format_datetime(&result.completed_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record result: {e}")))?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ProcessingResult>, Error> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RESULT_COLUMNS} FROM processing_results
                     ORDER BY completed_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent results: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent results: {e}")))?
        {
            out.push(row_to_result(&row)?);
        }
        Ok(out)
    }
}
