//! Store traits consumed by the router, runner and services, plus the
//! SQLite implementation.
//!
//! The traits are the seam between the automation core and the datastore;
//! tests substitute in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::domain::{
    EmailConnection, ExecutionLogId, ExecutionStatus, ProviderKind, RecurringTask, ScheduledEmail,
    ScheduledEmailId, TaskExecutionLog, TaskId, UserId,
};

use super::database::{Database, DatabaseError};
use super::queries::{self, tasks::DecodedTask};

/// Errors raised by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Access to users' provider connections.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// All connections a user holds, in any order.
    async fn connections_for_user(&self, user_id: &UserId) -> StoreResult<Vec<EmailConnection>>;

    async fn get_connection(
        &self,
        user_id: &UserId,
        provider: ProviderKind,
    ) -> StoreResult<Option<EmailConnection>>;

    /// Creates or replaces the connection for `(user, provider)`.
    async fn upsert_connection(&self, connection: &EmailConnection) -> StoreResult<()>;

    /// Persists a refreshed, already-encrypted token pair.
    ///
    /// A `None` refresh token keeps the stored one.
    async fn update_tokens(
        &self,
        user_id: &UserId,
        provider: ProviderKind,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Returns whether a connection was removed.
    async fn delete_connection(&self, user_id: &UserId, provider: ProviderKind)
        -> StoreResult<bool>;
}

/// Access to recurring tasks and their execution logs.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &RecurringTask) -> StoreResult<()>;

    async fn get_task(&self, id: &TaskId) -> StoreResult<Option<RecurringTask>>;

    async fn list_tasks(&self, user_id: &UserId) -> StoreResult<Vec<RecurringTask>>;

    /// Returns whether the task existed.
    async fn update_task(&self, task: &RecurringTask) -> StoreResult<bool>;

    async fn delete_task(&self, id: &TaskId) -> StoreResult<bool>;

    /// Enabled tasks with `next_run <= now`, at most `limit`, in no particular order.
    async fn due_tasks(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<RecurringTask>>;

    async fn record_execution(
        &self,
        id: &TaskId,
        last_executed: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn disable_task(&self, id: &TaskId) -> StoreResult<()>;

    async fn insert_log(&self, log: &TaskExecutionLog) -> StoreResult<()>;

    /// Moves a `running` log to its final status. Returns `false` if the
    /// log had already left `running`.
    async fn finish_log(
        &self,
        id: &ExecutionLogId,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn logs_for_task(&self, id: &TaskId, limit: usize) -> StoreResult<Vec<TaskExecutionLog>>;
}

/// Access to scheduled emails.
///
/// `claim_scheduled` is the single-writer gate for sending. Implementations
/// that cannot make it atomic still give at-least-once delivery.
#[async_trait]
pub trait ScheduledEmailStore: Send + Sync {
    async fn insert_scheduled(&self, email: &ScheduledEmail) -> StoreResult<()>;

    async fn get_scheduled(&self, id: &ScheduledEmailId) -> StoreResult<Option<ScheduledEmail>>;

    async fn list_scheduled(&self, user_id: &UserId) -> StoreResult<Vec<ScheduledEmail>>;

    async fn due_scheduled(&self, now: DateTime<Utc>, limit: usize)
        -> StoreResult<Vec<ScheduledEmail>>;

    /// `scheduled → sending`. Returns `false` if someone else got there first.
    async fn claim_scheduled(&self, id: &ScheduledEmailId) -> StoreResult<bool>;

    async fn mark_sent(
        &self,
        id: &ScheduledEmailId,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn mark_failed(&self, id: &ScheduledEmailId, error: &str) -> StoreResult<()>;

    /// `scheduled → canceled` for the owning user only.
    async fn cancel_scheduled(&self, id: &ScheduledEmailId, user_id: &UserId) -> StoreResult<bool>;
}

/// SQLite-backed implementation of every store trait.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Keeps valid tasks; disables and logs the ones whose schedule no
    /// longer decodes so they stop coming back as due.
    async fn keep_valid(&self, decoded: Vec<DecodedTask>, disable: bool) -> Vec<RecurringTask> {
        let mut valid = Vec::with_capacity(decoded.len());
        for entry in decoded {
            match entry {
                Ok(task) => valid.push(task),
                Err(invalid) => {
                    warn!(
                        task_id = %invalid.id,
                        user_id = %invalid.user_id,
                        reason = %invalid.reason,
                        "Skipping task with invalid schedule"
                    );
                    if disable {
                        if let Err(e) = self.disable_task(&invalid.id).await {
                            warn!(
                                task_id = %invalid.id,
                                error = %e,
                                "Failed to disable invalid task"
                            );
                        }
                    }
                }
            }
        }
        valid
    }
}

#[async_trait]
impl ConnectionStore for SqliteStore {
    async fn connections_for_user(&self, user_id: &UserId) -> StoreResult<Vec<EmailConnection>> {
        Ok(queries::connections::list_for_user(&self.db, user_id).await?)
    }

    async fn get_connection(
        &self,
        user_id: &UserId,
        provider: ProviderKind,
    ) -> StoreResult<Option<EmailConnection>> {
        Ok(queries::connections::get(&self.db, user_id, provider).await?)
    }

    async fn upsert_connection(&self, connection: &EmailConnection) -> StoreResult<()> {
        Ok(queries::connections::upsert(&self.db, connection).await?)
    }

    async fn update_tokens(
        &self,
        user_id: &UserId,
        provider: ProviderKind,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let updated = queries::connections::update_tokens(
            &self.db,
            user_id,
            provider,
            access_token_enc,
            refresh_token_enc,
            expires_at,
        )
        .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("{provider} connection for {user_id}")));
        }
        Ok(())
    }

    async fn delete_connection(
        &self,
        user_id: &UserId,
        provider: ProviderKind,
    ) -> StoreResult<bool> {
        Ok(queries::connections::delete(&self.db, user_id, provider).await?)
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &RecurringTask) -> StoreResult<()> {
        Ok(queries::tasks::insert(&self.db, task).await?)
    }

    async fn get_task(&self, id: &TaskId) -> StoreResult<Option<RecurringTask>> {
        match queries::tasks::get(&self.db, id).await? {
            Some(Ok(task)) => Ok(Some(task)),
            Some(Err(invalid)) => Err(StoreError::Corrupt {
                id: invalid.id.0,
                reason: invalid.reason,
            }),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self, user_id: &UserId) -> StoreResult<Vec<RecurringTask>> {
        let decoded = queries::tasks::list_for_user(&self.db, user_id).await?;
        Ok(self.keep_valid(decoded, false).await)
    }

    async fn update_task(&self, task: &RecurringTask) -> StoreResult<bool> {
        Ok(queries::tasks::update(&self.db, task).await?)
    }

    async fn delete_task(&self, id: &TaskId) -> StoreResult<bool> {
        Ok(queries::tasks::delete(&self.db, id).await?)
    }

    async fn due_tasks(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<RecurringTask>> {
        let decoded = queries::tasks::due(&self.db, now, limit).await?;
        Ok(self.keep_valid(decoded, true).await)
    }

    async fn record_execution(
        &self,
        id: &TaskId,
        last_executed: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> StoreResult<()> {
        if queries::tasks::record_execution(&self.db, id, last_executed, next_run).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("task {id}")))
        }
    }

    async fn disable_task(&self, id: &TaskId) -> StoreResult<()> {
        if queries::tasks::disable(&self.db, id).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("task {id}")))
        }
    }

    async fn insert_log(&self, log: &TaskExecutionLog) -> StoreResult<()> {
        Ok(queries::execution_logs::insert(&self.db, log).await?)
    }

    async fn finish_log(
        &self,
        id: &ExecutionLogId,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Ok(
            queries::execution_logs::finish(&self.db, id, status, result, error, completed_at)
                .await?,
        )
    }

    async fn logs_for_task(&self, id: &TaskId, limit: usize) -> StoreResult<Vec<TaskExecutionLog>> {
        Ok(queries::execution_logs::list_for_task(&self.db, id, limit).await?)
    }
}

#[async_trait]
impl ScheduledEmailStore for SqliteStore {
    async fn insert_scheduled(&self, email: &ScheduledEmail) -> StoreResult<()> {
        Ok(queries::scheduled_emails::insert(&self.db, email).await?)
    }

    async fn get_scheduled(&self, id: &ScheduledEmailId) -> StoreResult<Option<ScheduledEmail>> {
        Ok(queries::scheduled_emails::get(&self.db, id).await?)
    }

    async fn list_scheduled(&self, user_id: &UserId) -> StoreResult<Vec<ScheduledEmail>> {
        Ok(queries::scheduled_emails::list_for_user(&self.db, user_id).await?)
    }

    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ScheduledEmail>> {
        Ok(queries::scheduled_emails::due(&self.db, now, limit).await?)
    }

    async fn claim_scheduled(&self, id: &ScheduledEmailId) -> StoreResult<bool> {
        Ok(queries::scheduled_emails::claim(&self.db, id).await?)
    }

    async fn mark_sent(
        &self,
        id: &ScheduledEmailId,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if queries::scheduled_emails::mark_sent(&self.db, id, provider_message_id, sent_at).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("sending email {id}")))
        }
    }

    async fn mark_failed(&self, id: &ScheduledEmailId, error: &str) -> StoreResult<()> {
        if queries::scheduled_emails::mark_failed(&self.db, id, error).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("sending email {id}")))
        }
    }

    async fn cancel_scheduled(
        &self,
        id: &ScheduledEmailId,
        user_id: &UserId,
    ) -> StoreResult<bool> {
        Ok(queries::scheduled_emails::cancel(&self.db, id, user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InboxStatsConfig, TaskKind};
    use crate::schedule::Schedule;
    use chrono::Duration;

    async fn store() -> SqliteStore {
        SqliteStore::new(Database::open_in_memory().await.unwrap())
    }

    fn task(id: &str, next_run: DateTime<Utc>) -> RecurringTask {
        let now = Utc::now();
        RecurringTask {
            id: TaskId::from(id),
            user_id: UserId::from("user-1"),
            title: "Weekly stats".to_string(),
            kind: TaskKind::InboxStats(InboxStatsConfig::default()),
            schedule: Schedule::parse("weekly", "08:00", Some(1), None).unwrap(),
            enabled: true,
            last_executed: None,
            next_run,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn due_tasks_disables_undecodable_rows() {
        let store = store().await;
        let past = Utc::now() - Duration::minutes(1);
        store.insert_task(&task("good", past)).await.unwrap();
        store.insert_task(&task("bad", past)).await.unwrap();

        store
            .db()
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE recurring_tasks SET day_of_week = 9 WHERE id = 'bad'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let due = store.due_tasks(Utc::now(), 50).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, TaskId::from("good"));

        // The bad row is now disabled and never returned again.
        let enabled: i64 = store
            .db()
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT enabled FROM recurring_tasks WHERE id = 'bad'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(enabled, 0);

        assert!(matches!(
            store.get_task(&TaskId::from("bad")).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn disabled_task_is_no_longer_due() {
        let store = store().await;
        let past = Utc::now() - Duration::minutes(1);
        store.insert_task(&task("t1", past)).await.unwrap();

        store.disable_task(&TaskId::from("t1")).await.unwrap();

        assert!(store.due_tasks(Utc::now(), 50).await.unwrap().is_empty());
        assert!(matches!(
            store.disable_task(&TaskId::from("missing")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_tokens_on_missing_connection_is_not_found() {
        let store = store().await;
        let result = store
            .update_tokens(&UserId::from("ghost"), ProviderKind::Gmail, "a", None, None)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn mark_failed_without_claim_is_not_found() {
        let store = store().await;
        let result = store
            .mark_failed(&ScheduledEmailId::from("missing"), "boom")
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
