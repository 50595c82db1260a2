//! Schema steps for the intake database.
//!
//! `schema_version` records every applied step; [`migrate`] runs whatever is
//! newer than the highest recorded one.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Versions must stay strictly increasing.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "task_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS task_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name TEXT NOT NULL,
                task_id TEXT,
                payload TEXT NOT NULL,
                enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_task_queue_name_seq ON task_queue(queue_name, seq);
        "#,
    },
    Migration {
        version: 2,
        name: "sync_cursors",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                source TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                issued_at TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        "#,
    },
    Migration {
        version: 3,
        name: "processing_results",
        sql: r#"
            CREATE TABLE IF NOT EXISTS processing_results (
                task_id TEXT PRIMARY KEY,
                worker_id TEXT,
                outcome TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                error TEXT,
                output TEXT,
                completed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processing_results_completed
                ON processing_results(completed_at);
            CREATE INDEX IF NOT EXISTS idx_processing_results_outcome
                ON processing_results(outcome);
        "#,
    },
];

/// Bring the schema up to the latest version.
///
/// Each pending step runs together with its bookkeeping row inside one
/// transaction, so a failed step leaves the recorded version untouched.
pub async fn migrate(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_version table: {e}")))?;

    let from = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        tracing::debug!(version = from, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying schema step");
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO schema_version (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // Leave the connection usable if the batch died mid-transaction.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "step {} ({}): {e}",
                step.version, step.name
            )));
        }
    }

    tracing::info!(from, to = applied_version(conn).await?, "Schema migrated");
    Ok(())
}

/// Highest recorded step, 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("reading schema version: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("reading schema version: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("schema version column: {e}"))),
        None => Ok(0),
    }
}
