//! Task execution log operations.
//!
//! Logs are append-only. The only mutation is the single transition out of
//! `running`, guarded by a conditional update.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde_json::Value;

use crate::domain::{ExecutionLogId, ExecutionStatus, TaskExecutionLog, TaskId, UserId};
use crate::storage::database::{Database, Result};

use super::{parse_enum, parse_opt_ts, parse_ts};

/// Inserts a log row. Callers insert with status `running` before executing.
pub async fn insert(db: &Database, log: &TaskExecutionLog) -> Result<()> {
    let log = log.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO task_execution_logs (
                id, task_id, user_id, status, result, error, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                log.id.as_str(),
                log.task_id.as_str(),
                log.user_id.as_str(),
                log.status.as_str(),
                log.result.as_ref().map(Value::to_string),
                log.error,
                log.started_at.to_rfc3339(),
                log.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Moves a `running` log to its final status.
///
/// Returns `false` if the log was already finished, leaving it untouched.
pub async fn finish(
    db: &Database,
    id: &ExecutionLogId,
    status: ExecutionStatus,
    result: Option<Value>,
    error: Option<String>,
    completed_at: DateTime<Utc>,
) -> Result<bool> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let updated = conn.execute(
            r#"
            UPDATE task_execution_logs
            SET status = ?1, result = ?2, error = ?3, completed_at = ?4
            WHERE id = ?5 AND status = 'running'
            "#,
            params![
                status.as_str(),
                result.as_ref().map(Value::to_string),
                error,
                completed_at.to_rfc3339(),
                id.as_str(),
            ],
        )?;
        Ok(updated > 0)
    })
    .await
}

/// Retrieves the most recent logs for a task, newest first.
pub async fn list_for_task(
    db: &Database,
    task_id: &TaskId,
    limit: usize,
) -> Result<Vec<TaskExecutionLog>> {
    let task_id = task_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, task_id, user_id, status, result, error, started_at, completed_at
            FROM task_execution_logs
            WHERE task_id = ?1
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![task_id.as_str(), limit as i64], row_to_log)?;
        let logs: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(logs?)
    })
    .await
}

fn row_to_log(row: &Row<'_>) -> std::result::Result<TaskExecutionLog, rusqlite::Error> {
    let result: Option<String> = row.get(4)?;

    Ok(TaskExecutionLog {
        id: ExecutionLogId(row.get(0)?),
        task_id: TaskId(row.get(1)?),
        user_id: UserId(row.get(2)?),
        status: parse_enum(row, 3)?,
        // A result that is not valid JSON is kept as a string.
        result: result.map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
        error: row.get(5)?,
        started_at: parse_ts(row, 6)?,
        completed_at: parse_opt_ts(row, 7)?,
    })
}
