//! Recurring task management.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::{NewTask, RecurringTask, TaskExecutionLog, TaskId, UserId};
use crate::schedule::Schedule;
use crate::storage::TaskStore;

use super::{Result, ServiceError};

/// Creates, updates and lists a user's recurring tasks.
pub struct TaskService {
    tasks: Arc<dyn TaskStore>,
}

impl TaskService {
    pub fn new(tasks: Arc<dyn TaskStore>) -> Self {
        Self { tasks }
    }

    /// Loads a task owned by `user_id`. Tasks of other users read as missing.
    async fn owned(&self, user_id: &UserId, id: &TaskId) -> Result<RecurringTask> {
        match self.tasks.get_task(id).await? {
            Some(task) if &task.user_id == user_id => Ok(task),
            _ => Err(ServiceError::NotFound(id.to_string())),
        }
    }

    /// Validates and stores a new task with its first `next_run`.
    pub async fn create_task(
        &self,
        user_id: &UserId,
        new: NewTask,
        now: DateTime<Utc>,
    ) -> Result<RecurringTask> {
        new.kind.validate()?;

        let title = match new.title.trim() {
            "" => new.kind.task_type().to_string(),
            title => title.to_string(),
        };
        let task = RecurringTask {
            id: TaskId::generate(),
            user_id: user_id.clone(),
            title,
            next_run: new.schedule.next_after(now),
            kind: new.kind,
            schedule: new.schedule,
            enabled: new.enabled,
            last_executed: None,
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert_task(&task).await?;
        info!(
            task_id = %task.id,
            user_id = %user_id,
            task_type = %task.kind.task_type(),
            next_run = %task.next_run,
            "Created task"
        );
        Ok(task)
    }

    pub async fn update_schedule(
        &self,
        user_id: &UserId,
        id: &TaskId,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Result<RecurringTask> {
        let mut task = self.owned(user_id, id).await?;
        task.next_run = schedule.next_after(now);
        task.schedule = schedule;
        task.updated_at = now;
        if !self.tasks.update_task(&task).await? {
            return Err(ServiceError::NotFound(id.to_string()));
        }
        Ok(task)
    }

    /// Re-enabling a task recomputes `next_run` from `now` so it does not
    /// fire immediately for the time it spent disabled.
    pub async fn set_enabled(
        &self,
        user_id: &UserId,
        id: &TaskId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<RecurringTask> {
        let mut task = self.owned(user_id, id).await?;
        if enabled && !task.enabled {
            task.next_run = task.schedule.next_after(now);
        }
        task.enabled = enabled;
        task.updated_at = now;
        if !self.tasks.update_task(&task).await? {
            return Err(ServiceError::NotFound(id.to_string()));
        }
        Ok(task)
    }

    pub async fn delete_task(&self, user_id: &UserId, id: &TaskId) -> Result<()> {
        self.owned(user_id, id).await?;
        if !self.tasks.delete_task(id).await? {
            return Err(ServiceError::NotFound(id.to_string()));
        }
        info!(task_id = %id, user_id = %user_id, "Deleted task");
        Ok(())
    }

    pub async fn list_tasks(&self, user_id: &UserId) -> Result<Vec<RecurringTask>> {
        Ok(self.tasks.list_tasks(user_id).await?)
    }

    /// Most recent executions first.
    pub async fn recent_logs(
        &self,
        user_id: &UserId,
        id: &TaskId,
        limit: usize,
    ) -> Result<Vec<TaskExecutionLog>> {
        self.owned(user_id, id).await?;
        Ok(self.tasks.logs_for_task(id, limit).await?)
    }
}
