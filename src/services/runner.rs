//! Cron runner: processes due recurring tasks and scheduled emails.
//!
//! Each invocation is authorized with a pre-shared secret, fetches one
//! bounded batch and handles items sequentially. Item failures are recorded
//! per item; only a failed batch fetch aborts the invocation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ring::digest;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::RunnerSettings;
use crate::domain::{
    ExecutionLogId, ExecutionStatus, RecurringTask, ScheduledEmail, TaskExecutionLog,
};
use crate::providers::email::RequestCache;
use crate::router::{sanitize_error, truncate_chars, CallContext, Dispatched, ProviderRouter};
use crate::storage::{ScheduledEmailStore, TaskStore};

use super::TaskExecutor;

/// Errors that abort a whole invocation.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("missing or invalid runner credential")]
    Unauthorized,

    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type for runner invocations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Final state of one processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Failed,
    Sent,
    /// Another invocation claimed the email first.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemResult {
    pub id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What one invocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub results: Vec<ItemResult>,
}

impl RunSummary {
    fn push(&mut self, result: ItemResult) {
        self.processed += 1;
        self.results.push(result);
    }
}

/// Compares SHA-256 digests so timing does not depend on where inputs differ.
fn digests_match(expected: &digest::Digest, presented: &str) -> bool {
    let presented = digest::digest(&digest::SHA256, presented.as_bytes());
    expected
        .as_ref()
        .iter()
        .zip(presented.as_ref())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

pub struct CronRunner {
    tasks: Arc<dyn TaskStore>,
    emails: Arc<dyn ScheduledEmailStore>,
    executor: Arc<TaskExecutor>,
    router: Arc<ProviderRouter>,
    cache: Arc<RequestCache>,
    secret: digest::Digest,
    settings: RunnerSettings,
}

impl CronRunner {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        emails: Arc<dyn ScheduledEmailStore>,
        executor: Arc<TaskExecutor>,
        router: Arc<ProviderRouter>,
        cache: Arc<RequestCache>,
        secret: &str,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            tasks,
            emails,
            executor,
            router,
            cache,
            secret: digest::digest(&digest::SHA256, secret.as_bytes()),
            settings,
        }
    }

    fn authorize(&self, credential: Option<&str>) -> Result<()> {
        match credential {
            Some(presented) if !presented.is_empty() && digests_match(&self.secret, presented) => {
                Ok(())
            }
            _ => {
                warn!("Rejected runner invocation");
                Err(RunnerError::Unauthorized)
            }
        }
    }

    fn clip(&self, message: &str) -> String {
        truncate_chars(&sanitize_error(message), self.settings.error_max_len)
    }

    /// Executes every due recurring task once and reschedules it.
    pub async fn run_due_tasks(
        &self,
        credential: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RunSummary> {
        self.authorize(credential)?;

        let due = self
            .tasks
            .due_tasks(now, self.settings.task_batch_size)
            .await
            .map_err(|e| RunnerError::Storage(e.to_string()))?;
        if !due.is_empty() {
            info!(count = due.len(), "Running due tasks");
        }

        let mut summary = RunSummary::default();
        for task in due {
            summary.push(self.run_task(&task, now).await);
        }
        Ok(summary)
    }

    async fn run_task(&self, task: &RecurringTask, now: DateTime<Utc>) -> ItemResult {
        let log = TaskExecutionLog {
            id: ExecutionLogId::generate(),
            task_id: task.id.clone(),
            user_id: task.user_id.clone(),
            status: ExecutionStatus::Running,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        let (status, error) = match self.tasks.insert_log(&log).await {
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to record task start");
                (ItemStatus::Failed, Some(self.clip(&format!("execution log: {e}"))))
            }
            Ok(()) => {
                let outcome = self.executor.execute(task).await;
                let (log_status, result, error) = if outcome.success {
                    (ExecutionStatus::Success, Some(outcome.summary), None)
                } else {
                    let message = outcome
                        .error
                        .as_deref()
                        .map(|e| self.clip(e))
                        .unwrap_or_else(|| "task failed".to_string());
                    (ExecutionStatus::Failed, None, Some(message))
                };

                match self
                    .tasks
                    .finish_log(&log.id, log_status, result, error.clone(), Utc::now())
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            task_id = %task.id,
                            log_id = %log.id,
                            "Execution log already finished"
                        )
                    }
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "Failed to finish execution log")
                    }
                }

                let status = if outcome.success {
                    ItemStatus::Success
                } else {
                    ItemStatus::Failed
                };
                (status, error)
            }
        };

        let reference = now.max(Utc::now());
        let next_run = task.schedule.next_after(reference);
        if let Err(e) = self.tasks.record_execution(&task.id, reference, next_run).await {
            error!(task_id = %task.id, error = %e, "Failed to reschedule task");
            return ItemResult {
                id: task.id.to_string(),
                status: ItemStatus::Failed,
                error: Some(self.clip(&format!("reschedule: {e}"))),
            };
        }
        debug!(task_id = %task.id, next_run = %next_run, "Task rescheduled");

        ItemResult {
            id: task.id.to_string(),
            status,
            error,
        }
    }

    /// Sends every due scheduled email, claiming each one first.
    pub async fn run_scheduled_emails(
        &self,
        credential: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RunSummary> {
        self.authorize(credential)?;

        let due = self
            .emails
            .due_scheduled(now, self.settings.email_batch_size)
            .await
            .map_err(|e| RunnerError::Storage(e.to_string()))?;
        if !due.is_empty() {
            info!(count = due.len(), "Sending scheduled emails");
        }

        let mut summary = RunSummary::default();
        for email in due {
            summary.push(self.send_scheduled(&email).await);
        }
        Ok(summary)
    }

    async fn send_scheduled(&self, email: &ScheduledEmail) -> ItemResult {
        let id = email.id.to_string();
        match self.emails.claim_scheduled(&email.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(email_id = %email.id, "Scheduled email already claimed");
                return ItemResult {
                    id,
                    status: ItemStatus::Skipped,
                    error: None,
                };
            }
            Err(e) => {
                return ItemResult {
                    id,
                    status: ItemStatus::Failed,
                    error: Some(self.clip(&format!("claim: {e}"))),
                };
            }
        }

        let ctx = CallContext::background(self.cache.clone());
        let sent = self
            .router
            .send_message(&ctx, &email.user_id, &email.to_outgoing())
            .await;

        let failure = match sent {
            Ok(Dispatched::Done(message_id)) => {
                match self.emails.mark_sent(&email.id, &message_id, Utc::now()).await {
                    Ok(()) => {
                        info!(
                            email_id = %email.id,
                            user_id = %email.user_id,
                            "Scheduled email sent"
                        );
                        return ItemResult {
                            id,
                            status: ItemStatus::Sent,
                            error: None,
                        };
                    }
                    Err(e) => {
                        error!(email_id = %email.id, error = %e, "Sent but could not record it");
                        return ItemResult {
                            id,
                            status: ItemStatus::Failed,
                            error: Some(self.clip(&format!("mark sent: {e}"))),
                        };
                    }
                }
            }
            Ok(Dispatched::Unsupported(u)) => {
                format!("{} cannot {}", u.provider, u.operation)
            }
            Err(e) => e.to_string(),
        };

        let message = self.clip(&failure);
        warn!(
            email_id = %email.id,
            user_id = %email.user_id,
            error = %message,
            "Scheduled email failed"
        );
        if let Err(e) = self.emails.mark_failed(&email.id, &message).await {
            error!(email_id = %email.id, error = %e, "Failed to record send failure");
        }
        ItemResult {
            id,
            status: ItemStatus::Failed,
            error: Some(message),
        }
    }

    /// Polls both queues on independent intervals until `shutdown` flips to
    /// `true` or its sender is dropped.
    pub async fn run_forever(self: Arc<Self>, credential: String, shutdown: watch::Receiver<bool>) {
        let tasks = tokio::spawn(Self::poll(
            self.clone(),
            credential.clone(),
            Duration::from_secs(self.settings.task_poll_interval_secs.max(1)),
            shutdown.clone(),
            Queue::Tasks,
        ));
        let emails = tokio::spawn(Self::poll(
            self.clone(),
            credential,
            Duration::from_secs(self.settings.email_poll_interval_secs.max(1)),
            shutdown,
            Queue::Emails,
        ));

        for handle in [tasks, emails] {
            if let Err(e) = handle.await {
                error!(error = %e, "Runner loop panicked");
            }
        }
        info!("Runner stopped");
    }

    async fn poll(
        self: Arc<Self>,
        credential: String,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        queue: Queue,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let now = Utc::now();
            let result = match queue {
                Queue::Tasks => self.run_due_tasks(Some(&credential), now).await,
                Queue::Emails => self.run_scheduled_emails(Some(&credential), now).await,
            };
            match result {
                Ok(summary) if summary.processed > 0 => {
                    let failed = summary
                        .results
                        .iter()
                        .filter(|r| r.status == ItemStatus::Failed)
                        .count();
                    info!(
                        queue = queue.as_str(),
                        processed = summary.processed,
                        failed,
                        "Invocation finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(queue = queue.as_str(), error = %e, "Invocation aborted"),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Queue {
    Tasks,
    Emails,
}

impl Queue {
    fn as_str(self) -> &'static str {
        match self {
            Queue::Tasks => "tasks",
            Queue::Emails => "emails",
        }
    }
}

impl std::fmt::Debug for CronRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronRunner")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
