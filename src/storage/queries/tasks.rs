//! Recurring task CRUD operations.
//!
//! Task kind and schedule are decoded leniently: a row whose schedule no
//! longer validates comes back as [`InvalidTask`] instead of failing the
//! whole query.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use crate::domain::{RecurringTask, TaskId, TaskKind, UserId};
use crate::schedule::Schedule;
use crate::storage::database::{Database, Result};

use super::{parse_opt_ts, parse_ts};

/// A stored task whose schedule cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTask {
    pub id: TaskId,
    pub user_id: UserId,
    pub reason: String,
}

/// Outcome of decoding one task row.
pub type DecodedTask = std::result::Result<RecurringTask, InvalidTask>;

const SELECT_COLUMNS: &str = r#"
    SELECT
        id, user_id, title, task_type, task_config, frequency, time_of_day,
        day_of_week, day_of_month, enabled, last_executed, next_run,
        created_at, updated_at
    FROM recurring_tasks
"#;

/// Inserts a new task.
pub async fn insert(db: &Database, task: &RecurringTask) -> Result<()> {
    let task = task.clone();

    db.with_conn(move |conn| {
        let schedule = &task.schedule;
        conn.execute(
            r#"
            INSERT INTO recurring_tasks (
                id, user_id, title, task_type, task_config, frequency, time_of_day,
                day_of_week, day_of_month, enabled, last_executed, next_run,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                task.id.as_str(),
                task.user_id.as_str(),
                task.title,
                task.kind.task_type(),
                task.kind.config_json().to_string(),
                schedule.frequency().as_str(),
                schedule.time_of_day(),
                schedule.day_of_week(),
                schedule.day_of_month(),
                task.enabled as i32,
                task.last_executed.map(|t| t.to_rfc3339()),
                task.next_run.to_rfc3339(),
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a task by its ID.
pub async fn get(db: &Database, id: &TaskId) -> Result<Option<DecodedTask>> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let result = stmt.query_row([id.as_str()], row_to_task).optional()?;
        Ok(result)
    })
    .await
}

/// Retrieves all tasks owned by a user, oldest first.
pub async fn list_for_user(db: &Database, user_id: &UserId) -> Result<Vec<DecodedTask>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("{SELECT_COLUMNS} WHERE user_id = ?1 ORDER BY created_at, id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([user_id.as_str()], row_to_task)?;
        let tasks: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(tasks?)
    })
    .await
}

/// Retrieves enabled tasks whose `next_run` has passed.
pub async fn due(db: &Database, now: DateTime<Utc>, limit: usize) -> Result<Vec<DecodedTask>> {
    db.with_conn(move |conn| {
        // RFC 3339 in UTC sorts lexicographically, but compare via julianday to
        // tolerate rows written with other offsets.
        let sql = format!(
            "{SELECT_COLUMNS} WHERE enabled = 1 AND julianday(next_run) <= julianday(?1) LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now.to_rfc3339(), limit as i64], row_to_task)?;
        let tasks: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(tasks?)
    })
    .await
}

/// Rewrites the user-editable fields of a task. Returns whether it existed.
pub async fn update(db: &Database, task: &RecurringTask) -> Result<bool> {
    let task = task.clone();

    db.with_conn(move |conn| {
        let schedule = &task.schedule;
        let updated = conn.execute(
            r#"
            UPDATE recurring_tasks
            SET title = ?1, task_type = ?2, task_config = ?3, frequency = ?4,
                time_of_day = ?5, day_of_week = ?6, day_of_month = ?7, enabled = ?8,
                next_run = ?9, updated_at = ?10
            WHERE id = ?11
            "#,
            params![
                task.title,
                task.kind.task_type(),
                task.kind.config_json().to_string(),
                schedule.frequency().as_str(),
                schedule.time_of_day(),
                schedule.day_of_week(),
                schedule.day_of_month(),
                task.enabled as i32,
                task.next_run.to_rfc3339(),
                task.updated_at.to_rfc3339(),
                task.id.as_str(),
            ],
        )?;
        Ok(updated > 0)
    })
    .await
}

/// Records an execution attempt: sets `last_executed` and the new `next_run`.
pub async fn record_execution(
    db: &Database,
    id: &TaskId,
    last_executed: DateTime<Utc>,
    next_run: DateTime<Utc>,
) -> Result<bool> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let updated = conn.execute(
            r#"
            UPDATE recurring_tasks
            SET last_executed = ?1, next_run = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![
                last_executed.to_rfc3339(),
                next_run.to_rfc3339(),
                Utc::now().to_rfc3339(),
                id.as_str(),
            ],
        )?;
        Ok(updated > 0)
    })
    .await
}

/// Disables a task so it is no longer picked up as due.
pub async fn disable(db: &Database, id: &TaskId) -> Result<bool> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let updated = conn.execute(
            "UPDATE recurring_tasks SET enabled = 0, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.as_str()],
        )?;
        Ok(updated > 0)
    })
    .await
}

/// Deletes a task and its execution logs.
pub async fn delete(db: &Database, id: &TaskId) -> Result<bool> {
    let id = id.clone();

    db.transaction(move |tx| {
        tx.execute("DELETE FROM task_execution_logs WHERE task_id = ?1", [id.as_str()])?;
        let deleted = tx.execute("DELETE FROM recurring_tasks WHERE id = ?1", [id.as_str()])?;
        Ok(deleted > 0)
    })
    .await
}

fn row_to_task(row: &Row<'_>) -> std::result::Result<DecodedTask, rusqlite::Error> {
    let id = TaskId(row.get(0)?);
    let user_id = UserId(row.get(1)?);

    let task_type: String = row.get(3)?;
    let config_raw: String = row.get(4)?;
    let kind = match serde_json::from_str::<Value>(&config_raw) {
        Ok(config) => TaskKind::from_parts(&task_type, &config),
        Err(e) => TaskKind::Unrecognized {
            task_type,
            config: Value::Null,
            reason: format!("config is not JSON: {e}"),
        },
    };

    let frequency: String = row.get(5)?;
    let time_of_day: String = row.get(6)?;
    let day_of_week: Option<u32> = row.get(7)?;
    let day_of_month: Option<u32> = row.get(8)?;
    let schedule = match Schedule::parse(&frequency, &time_of_day, day_of_week, day_of_month) {
        Ok(schedule) => schedule,
        Err(e) => {
            return Ok(Err(InvalidTask {
                id,
                user_id,
                reason: e.to_string(),
            }))
        }
    };

    Ok(Ok(RecurringTask {
        id,
        user_id,
        title: row.get(2)?,
        kind,
        schedule,
        enabled: row.get::<_, i32>(9)? != 0,
        last_executed: parse_opt_ts(row, 10)?,
        next_run: parse_ts(row, 11)?,
        created_at: parse_ts(row, 12)?,
        updated_at: parse_ts(row, 13)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QuerySweepConfig;
    use chrono::Duration;

    fn make_task(id: &str, next_run: DateTime<Utc>) -> RecurringTask {
        let now = Utc::now();
        RecurringTask {
            id: TaskId::from(id),
            user_id: UserId::from("user-1"),
            title: "Archive old newsletters".to_string(),
            kind: TaskKind::ArchiveByQuery(QuerySweepConfig::new(
                "category:promotions older_than:30d",
            )),
            schedule: Schedule::parse("daily", "09:00", None, None).unwrap(),
            enabled: true,
            last_executed: None,
            next_run,
            created_at: now,
            updated_at: now,
        }
    }

    fn unwrap_valid(decoded: DecodedTask) -> RecurringTask {
        decoded.unwrap_or_else(|invalid| panic!("unexpected invalid task: {invalid:?}"))
    }

    #[tokio::test]
    async fn insert_and_get_task() {
        let db = Database::open_in_memory().await.unwrap();
        let task = make_task("task-1", Utc::now());

        insert(&db, &task).await.unwrap();

        let loaded = unwrap_valid(get(&db, &task.id).await.unwrap().unwrap());
        assert_eq!(loaded.kind, task.kind);
        assert_eq!(loaded.schedule, task.schedule);
        assert!(loaded.enabled);
        assert_eq!(loaded.last_executed, None);

        assert!(get(&db, &TaskId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_respects_enabled_next_run_and_limit() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();

        insert(&db, &make_task("past-1", now - Duration::minutes(5))).await.unwrap();
        insert(&db, &make_task("past-2", now - Duration::hours(1))).await.unwrap();
        insert(&db, &make_task("future", now + Duration::hours(1))).await.unwrap();
        let mut disabled = make_task("disabled", now - Duration::hours(1));
        disabled.enabled = false;
        insert(&db, &disabled).await.unwrap();

        let due_tasks = due(&db, now, 50).await.unwrap();
        let mut ids: Vec<String> = due_tasks
            .into_iter()
            .map(|t| unwrap_valid(t).id.0)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["past-1".to_string(), "past-2".to_string()]);

        assert_eq!(due(&db, now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_schedule_decodes_as_invalid_task() {
        let db = Database::open_in_memory().await.unwrap();
        let task = make_task("broken", Utc::now() - Duration::minutes(1));
        insert(&db, &task).await.unwrap();

        db.with_conn(|conn| {
            conn.execute(
                r#"
                UPDATE recurring_tasks SET frequency = 'weekly', day_of_week = NULL
                WHERE id = 'broken'
                "#,
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let due_tasks = due(&db, Utc::now(), 10).await.unwrap();
        assert_eq!(due_tasks.len(), 1);
        let invalid = due_tasks.into_iter().next().unwrap().unwrap_err();
        assert_eq!(invalid.id, TaskId::from("broken"));
        assert!(invalid.reason.contains("day of week"));
    }

    #[tokio::test]
    async fn unknown_task_type_loads_as_unrecognized() {
        let db = Database::open_in_memory().await.unwrap();
        let task = make_task("legacy", Utc::now());
        insert(&db, &task).await.unwrap();

        db.with_conn(|conn| {
            conn.execute(
                "UPDATE recurring_tasks SET task_type = 'ai_summary' WHERE id = 'legacy'",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let loaded = unwrap_valid(get(&db, &task.id).await.unwrap().unwrap());
        assert_eq!(loaded.kind.task_type(), "ai_summary");
        assert!(matches!(loaded.kind, TaskKind::Unrecognized { .. }));
    }

    #[tokio::test]
    async fn record_execution_and_disable() {
        let db = Database::open_in_memory().await.unwrap();
        let task = make_task("task-1", Utc::now() - Duration::minutes(1));
        insert(&db, &task).await.unwrap();

        let ran_at = Utc::now();
        let next = ran_at + Duration::days(1);
        assert!(record_execution(&db, &task.id, ran_at, next).await.unwrap());

        let loaded = unwrap_valid(get(&db, &task.id).await.unwrap().unwrap());
        assert_eq!(loaded.last_executed.map(|t| t.timestamp()), Some(ran_at.timestamp()));
        assert_eq!(loaded.next_run.timestamp(), next.timestamp());

        assert!(disable(&db, &task.id).await.unwrap());
        assert!(due(&db, next + Duration::days(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_and_delete() {
        let db = Database::open_in_memory().await.unwrap();
        let mut task = make_task("task-1", Utc::now());
        insert(&db, &task).await.unwrap();

        task.title = "Renamed".to_string();
        task.schedule = Schedule::parse("weekly", "07:00", Some(1), None).unwrap();
        assert!(update(&db, &task).await.unwrap());

        let loaded = unwrap_valid(get(&db, &task.id).await.unwrap().unwrap());
        assert_eq!(loaded.title, "Renamed");
        assert_eq!(loaded.schedule.day_of_week(), Some(1));

        assert_eq!(list_for_user(&db, &task.user_id).await.unwrap().len(), 1);
        assert!(delete(&db, &task.id).await.unwrap());
        assert!(!delete(&db, &task.id).await.unwrap());
        assert!(list_for_user(&db, &task.user_id).await.unwrap().is_empty());
    }
}
