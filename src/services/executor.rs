//! Runs one recurring task against the user's mailbox.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ExecutorSettings;
use crate::domain::{
    InboxStatsConfig, LabelEmailsConfig, MessageFlag, MessageId, NormalizedMessage,
    QuerySweepConfig, RecurringTask, TaskKind, UnsubscribeSweepConfig, UserId,
};
use crate::providers::email::RequestCache;
use crate::router::{
    truncate_chars, CallContext, Dispatched, ProviderRouter, RouterError, Unsupported,
    MAX_ERROR_LEN,
};

/// Result of executing a task. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub success: bool,
    pub summary: Value,
    pub error: Option<String>,
}

impl TaskOutcome {
    fn succeeded(summary: Value) -> Self {
        Self {
            success: true,
            summary,
            error: None,
        }
    }

    fn failed(error: &str) -> Self {
        Self {
            success: false,
            summary: Value::Null,
            error: Some(truncate_chars(error, MAX_ERROR_LEN)),
        }
    }
}

fn unsupported_summary(found: usize, unsupported: &Unsupported) -> Value {
    json!({
        "found": found,
        "unsupported": unsupported,
    })
}

/// Splits candidates into actionable ids and a skipped count.
///
/// Drafts are never touched; starred messages only when unprotected.
fn eligible(messages: &[NormalizedMessage], protect_starred: bool) -> (Vec<MessageId>, usize) {
    let ids: Vec<MessageId> = messages
        .iter()
        .filter(|m| !m.has_flag(MessageFlag::Draft))
        .filter(|m| !(protect_starred && m.has_flag(MessageFlag::Starred)))
        .map(|m| m.id.clone())
        .collect();
    let skipped = messages.len() - ids.len();
    (ids, skipped)
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Archive,
    Trash,
}

impl Sweep {
    fn counter(self) -> &'static str {
        match self {
            Sweep::Archive => "archived",
            Sweep::Trash => "trashed",
        }
    }
}

/// Executes recurring tasks through the router in background context.
pub struct TaskExecutor {
    router: Arc<ProviderRouter>,
    cache: Arc<RequestCache>,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(
        router: Arc<ProviderRouter>,
        cache: Arc<RequestCache>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            router,
            cache,
            settings,
        }
    }

    fn cap(&self, requested: u32) -> u32 {
        requested.min(self.settings.max_results_cap).max(1)
    }

    /// Executes `task` once. Never returns an error and never panics on
    /// provider failure.
    pub async fn execute(&self, task: &RecurringTask) -> TaskOutcome {
        let ctx = CallContext::background(self.cache.clone());
        let user = &task.user_id;

        let result = match &task.kind {
            TaskKind::ArchiveByQuery(cfg) => self.sweep(&ctx, user, cfg, Sweep::Archive).await,
            TaskKind::TrashByQuery(cfg) => self.sweep(&ctx, user, cfg, Sweep::Trash).await,
            TaskKind::LabelEmails(cfg) => self.label(&ctx, user, cfg).await,
            TaskKind::UnsubscribeSweep(cfg) => self.unsubscribe(&ctx, user, cfg).await,
            TaskKind::InboxStats(cfg) => self.stats(&ctx, user, cfg).await,
            TaskKind::Unrecognized {
                task_type, reason, ..
            } => {
                warn!(task_id = %task.id, task_type = %task_type, "Unrecognized task type");
                let message = format!("unrecognized task type: {task_type} ({reason})");
                return TaskOutcome::failed(&message);
            }
        };

        match result {
            Ok(summary) => {
                info!(
                    task_id = %task.id,
                    user_id = %user,
                    task_type = %task.kind.task_type(),
                    "Task executed"
                );
                TaskOutcome::succeeded(summary)
            }
            Err(e) => {
                warn!(task_id = %task.id, user_id = %user, error = %e, "Task failed");
                TaskOutcome::failed(&e.to_string())
            }
        }
    }

    async fn scan(
        &self,
        ctx: &CallContext,
        user: &UserId,
        query: &str,
        max_results: u32,
    ) -> Result<Dispatched<Vec<NormalizedMessage>>, RouterError> {
        let scan = self
            .router
            .scan_inbox(ctx, user, query, self.cap(max_results))
            .await?;
        Ok(scan.map(|page| {
            if !page.unsupported.is_empty() {
                debug!(
                    user_id = %user,
                    unsupported = ?page.unsupported,
                    "Partial query translation"
                );
            }
            page.messages
        }))
    }

    async fn sweep(
        &self,
        ctx: &CallContext,
        user: &UserId,
        cfg: &QuerySweepConfig,
        action: Sweep,
    ) -> Result<Value, RouterError> {
        let messages = match self.scan(ctx, user, &cfg.query, cfg.max_results).await? {
            Dispatched::Done(messages) => messages,
            Dispatched::Unsupported(u) => return Ok(unsupported_summary(0, &u)),
        };
        let found = messages.len();
        let counter = action.counter();
        if found == 0 {
            return Ok(json!({ "found": 0, counter: 0 }));
        }

        let (ids, skipped) = eligible(&messages, cfg.protect_starred);
        if ids.is_empty() {
            return Ok(json!({ "found": found, counter: 0, "skipped": skipped }));
        }

        let dispatched = match action {
            Sweep::Archive => self.router.archive(ctx, user, &ids).await?,
            Sweep::Trash => self.router.trash(ctx, user, &ids).await?,
        };
        Ok(match dispatched {
            Dispatched::Done(count) => {
                json!({ "found": found, counter: count, "skipped": skipped })
            }
            Dispatched::Unsupported(u) => unsupported_summary(found, &u),
        })
    }

    async fn label(
        &self,
        ctx: &CallContext,
        user: &UserId,
        cfg: &LabelEmailsConfig,
    ) -> Result<Value, RouterError> {
        let messages = match self.scan(ctx, user, &cfg.query, cfg.max_results).await? {
            Dispatched::Done(messages) => messages,
            Dispatched::Unsupported(u) => return Ok(unsupported_summary(0, &u)),
        };
        let found = messages.len();
        if found == 0 {
            return Ok(json!({ "found": 0, "labeled": 0 }));
        }

        let (ids, skipped) = eligible(&messages, false);
        if ids.is_empty() {
            return Ok(json!({ "found": found, "labeled": 0, "skipped": skipped }));
        }

        let labels = [cfg.label.clone()];
        let change = match self.router.apply_labels(ctx, user, &ids, &labels, &[]).await? {
            Dispatched::Done(change) => change,
            Dispatched::Unsupported(u) => return Ok(unsupported_summary(found, &u)),
        };
        let mut summary = json!({
            "found": found,
            "labeled": change.messages,
            "label": cfg.label,
            "skipped": skipped,
        });

        if cfg.archive {
            match self.router.archive(ctx, user, &ids).await? {
                Dispatched::Done(count) => summary["archived"] = json!(count),
                Dispatched::Unsupported(u) => summary["unsupported"] = json!(u),
            }
        }
        Ok(summary)
    }

    async fn unsubscribe(
        &self,
        ctx: &CallContext,
        user: &UserId,
        cfg: &UnsubscribeSweepConfig,
    ) -> Result<Value, RouterError> {
        let candidates = match self
            .router
            .find_unsubscribable(ctx, user, cfg.max_senders)
            .await?
        {
            Dispatched::Done(candidates) => candidates,
            Dispatched::Unsupported(u) => return Ok(unsupported_summary(0, &u)),
        };
        let found = candidates.len();
        if found == 0 {
            return Ok(json!({ "found": 0, "unsubscribed": 0 }));
        }

        let report = match self.router.bulk_unsubscribe(ctx, user, &candidates).await? {
            Dispatched::Done(report) => report,
            Dispatched::Unsupported(u) => return Ok(unsupported_summary(found, &u)),
        };
        let mut summary = json!({
            "found": found,
            "unsubscribed": report.succeeded.len(),
            "failed": report.failed,
        });

        if cfg.archive_after && !report.succeeded.is_empty() {
            let mut archived = 0;
            for sender in &report.succeeded {
                let query = format!("from:{sender} in:inbox");
                let ids: Vec<MessageId> = match self
                    .scan(ctx, user, &query, self.settings.max_results_cap)
                    .await?
                {
                    Dispatched::Done(messages) => eligible(&messages, true).0,
                    Dispatched::Unsupported(_) => continue,
                };
                if let Dispatched::Done(count) = self.router.archive(ctx, user, &ids).await? {
                    archived += count;
                }
            }
            summary["archived"] = json!(archived);
        }
        Ok(summary)
    }

    async fn stats(
        &self,
        ctx: &CallContext,
        user: &UserId,
        cfg: &InboxStatsConfig,
    ) -> Result<Value, RouterError> {
        let stats = match self.router.get_stats(ctx, user).await? {
            Dispatched::Done(stats) => stats,
            Dispatched::Unsupported(u) => return Ok(unsupported_summary(0, &u)),
        };
        let sample = match self.scan(ctx, user, "in:inbox", cfg.sample_size).await? {
            Dispatched::Done(messages) => messages,
            Dispatched::Unsupported(_) => Vec::new(),
        };

        let mut counts: HashMap<String, usize> = HashMap::new();
        for message in &sample {
            *counts.entry(message.from.email.to_lowercase()).or_default() += 1;
        }
        let mut top: Vec<(String, usize)> = counts.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(cfg.top_senders as usize);

        Ok(json!({
            "found": sample.len(),
            "stats": stats,
            "top_senders": top
                .into_iter()
                .map(|(email, count)| json!({ "email": email, "count": count }))
                .collect::<Vec<_>>(),
        }))
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProviderKind, TaskId};
    use crate::schedule::Schedule;
    use crate::storage::StorageLayer;
    use crate::testing::{candidate, connect, message, with_flag, FakeFactory};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    async fn executor(provider: ProviderKind) -> (TaskExecutor, FakeFactory) {
        let storage = StorageLayer::in_memory().await.unwrap();
        let store = storage.store();
        connect(&*store, &UserId::from("u1"), provider).await;
        let factory = FakeFactory::default();
        let router = ProviderRouter::new(store, Arc::new(factory.clone()));
        let executor = TaskExecutor::new(
            Arc::new(router),
            Arc::new(RequestCache::default()),
            ExecutorSettings::default(),
        );
        (executor, factory)
    }

    fn task(kind: TaskKind) -> RecurringTask {
        let now = Utc::now();
        RecurringTask {
            id: TaskId::from("task-1"),
            user_id: UserId::from("u1"),
            title: "cleanup".to_string(),
            kind,
            schedule: Schedule::hourly(0).unwrap(),
            enabled: true,
            last_executed: None,
            next_run: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn empty_archive_query_succeeds_with_zero_counts() {
        let (executor, _) = executor(ProviderKind::Gmail).await;
        let outcome = executor
            .execute(&task(TaskKind::ArchiveByQuery(QuerySweepConfig::new("from:nobody@x.com"))))
            .await;
        assert_eq!(
            outcome,
            TaskOutcome {
                success: true,
                summary: json!({ "found": 0, "archived": 0 }),
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn archive_skips_drafts_and_protected_stars() {
        let (executor, factory) = executor(ProviderKind::Gmail).await;
        let mailbox = factory.mailbox(ProviderKind::Gmail);
        mailbox.add(message("m1", "deals@shop.com"));
        mailbox.add(with_flag(message("m2", "deals@shop.com"), MessageFlag::Starred));
        mailbox.add(with_flag(message("m3", "deals@shop.com"), MessageFlag::Draft));
        mailbox.add(message("m4", "friend@example.com"));

        let outcome = executor
            .execute(&task(TaskKind::ArchiveByQuery(QuerySweepConfig::new("from:deals@shop.com"))))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.summary, json!({ "found": 3, "archived": 1, "skipped": 2 }));
        assert_eq!(mailbox.archived(), vec![MessageId::from("m1")]);
    }

    #[tokio::test]
    async fn trash_without_star_protection_includes_starred() {
        let (executor, factory) = executor(ProviderKind::Gmail).await;
        let mailbox = factory.mailbox(ProviderKind::Gmail);
        mailbox.add(with_flag(message("m1", "old@list.com"), MessageFlag::Starred));

        let mut cfg = QuerySweepConfig::new("from:old@list.com");
        cfg.protect_starred = false;
        let outcome = executor.execute(&task(TaskKind::TrashByQuery(cfg))).await;

        assert_eq!(outcome.summary, json!({ "found": 1, "trashed": 1, "skipped": 0 }));
        assert_eq!(mailbox.trashed(), vec![MessageId::from("m1")]);
    }

    #[tokio::test]
    async fn label_and_archive() {
        let (executor, factory) = executor(ProviderKind::Outlook).await;
        let mailbox = factory.mailbox(ProviderKind::Outlook);
        mailbox.add(message("m1", "billing@example.com"));

        let outcome = executor
            .execute(&task(TaskKind::LabelEmails(LabelEmailsConfig {
                query: "from:billing@example.com".to_string(),
                label: "Receipts".to_string(),
                max_results: 10,
                archive: true,
            })))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.summary["labeled"], json!(1));
        assert_eq!(outcome.summary["archived"], json!(1));
        assert!(mailbox.labels_of("m1").contains("Receipts"));
    }

    #[tokio::test]
    async fn unsubscribe_sweep_reports_successes_and_failures() {
        let (executor, factory) = executor(ProviderKind::Gmail).await;
        let mailbox = factory.mailbox(ProviderKind::Gmail);
        mailbox.add_candidate(candidate("news@list.com"));
        mailbox.add_candidate(candidate("bad@list.com"));
        mailbox.reject_unsubscribe("bad@list.com");
        mailbox.add(message("m1", "news@list.com"));

        let outcome = executor
            .execute(&task(TaskKind::UnsubscribeSweep(UnsubscribeSweepConfig {
                max_senders: 10,
                archive_after: true,
            })))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.summary["found"], json!(2));
        assert_eq!(outcome.summary["unsubscribed"], json!(1));
        assert_eq!(outcome.summary["archived"], json!(1));
        assert_eq!(mailbox.unsubscribed(), vec!["news@list.com".to_string()]);
    }

    #[tokio::test]
    async fn inbox_stats_ranks_senders() {
        let (executor, factory) = executor(ProviderKind::Gmail).await;
        let mailbox = factory.mailbox(ProviderKind::Gmail);
        mailbox.add(message("m1", "a@x.com"));
        mailbox.add(message("m2", "b@x.com"));
        mailbox.add(message("m3", "B@x.com"));

        let outcome = executor
            .execute(&task(TaskKind::InboxStats(InboxStatsConfig {
                sample_size: 50,
                top_senders: 1,
            })))
            .await;

        assert_eq!(outcome.summary["stats"]["inbox_total"], json!(3));
        assert_eq!(
            outcome.summary["top_senders"],
            json!([{ "email": "b@x.com", "count": 2 }])
        );
    }

    #[tokio::test]
    async fn unrecognized_kind_is_a_reported_failure() {
        let (executor, _) = executor(ProviderKind::Gmail).await;
        let outcome = executor
            .execute(&task(TaskKind::from_parts("summarize_inbox", &Value::Null)))
            .await;
        assert!(!outcome.success);
        assert!(outcome
            .error
            .unwrap()
            .starts_with("unrecognized task type: summarize_inbox"));
    }

    #[tokio::test]
    async fn router_errors_become_failed_outcomes() {
        let (executor, factory) = executor(ProviderKind::Gmail).await;
        factory.mailbox(ProviderKind::Gmail).expire_auth();

        let outcome = executor
            .execute(&task(TaskKind::ArchiveByQuery(QuerySweepConfig::new("is:read"))))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("authorization expired"));
    }

    #[tokio::test]
    async fn missing_connection_is_a_failed_outcome() {
        let (executor, _) = executor(ProviderKind::Gmail).await;
        let mut orphan = task(TaskKind::InboxStats(InboxStatsConfig::default()));
        orphan.user_id = UserId::from("ghost");
        let outcome = executor.execute(&orphan).await;
        assert_eq!(outcome.error.as_deref(), Some("no email connection for user ghost"));
    }
}
