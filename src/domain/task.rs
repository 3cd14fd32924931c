//! Recurring task domain types.
//!
//! A task's kind is a tagged union with one typed configuration per task
//! type. Rows that cannot be decoded load as [`TaskKind::Unrecognized`] so a
//! single bad row never prevents the rest of a batch from loading.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{ExecutionLogId, TaskId, UserId};
use crate::schedule::Schedule;

/// Errors raised when a task configuration fails validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskConfigError {
    #[error("unrecognized task type '{task_type}': {reason}")]
    Unrecognized { task_type: String, reason: String },

    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("{field} = {value} is out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

fn default_max_results() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_max_senders() -> u32 {
    25
}

fn default_top_senders() -> u32 {
    10
}

/// Configuration shared by the archive and trash sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySweepConfig {
    /// Gmail-style search query selecting candidates.
    pub query: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    /// Leave starred messages alone.
    #[serde(default = "default_true")]
    pub protect_starred: bool,
}

impl QuerySweepConfig {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: default_max_results(),
            protect_starred: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeSweepConfig {
    #[serde(default = "default_max_senders")]
    pub max_senders: u32,
    /// Archive the sender's messages after a successful unsubscribe.
    #[serde(default)]
    pub archive_after: bool,
}

impl Default for UnsubscribeSweepConfig {
    fn default() -> Self {
        Self {
            max_senders: default_max_senders(),
            archive_after: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxStatsConfig {
    /// Number of recent inbox messages sampled for sender counts.
    #[serde(default = "default_max_results")]
    pub sample_size: u32,
    #[serde(default = "default_top_senders")]
    pub top_senders: u32,
}

impl Default for InboxStatsConfig {
    fn default() -> Self {
        Self {
            sample_size: default_max_results(),
            top_senders: default_top_senders(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEmailsConfig {
    pub query: String,
    /// Label (Gmail) or folder (Outlook) display name.
    pub label: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    /// Also remove the messages from the inbox.
    #[serde(default)]
    pub archive: bool,
}

/// What a recurring task does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TaskKindRecord", into = "TaskKindRecord")]
pub enum TaskKind {
    ArchiveByQuery(QuerySweepConfig),
    TrashByQuery(QuerySweepConfig),
    UnsubscribeSweep(UnsubscribeSweepConfig),
    InboxStats(InboxStatsConfig),
    LabelEmails(LabelEmailsConfig),
    /// A stored type or config that could not be decoded.
    Unrecognized {
        task_type: String,
        config: Value,
        reason: String,
    },
}

impl TaskKind {
    pub const ARCHIVE_BY_QUERY: &'static str = "archive_by_query";
    pub const TRASH_BY_QUERY: &'static str = "trash_by_query";
    pub const UNSUBSCRIBE_SWEEP: &'static str = "unsubscribe_sweep";
    pub const INBOX_STATS: &'static str = "inbox_stats";
    pub const LABEL_EMAILS: &'static str = "label_emails";

    /// Decodes a stored `(task_type, config)` pair. Never fails.
    pub fn from_parts(task_type: &str, config: &Value) -> Self {
        fn decode<T: serde::de::DeserializeOwned>(
            task_type: &str,
            config: &Value,
            wrap: fn(T) -> TaskKind,
        ) -> TaskKind {
            // A missing config means "all defaults".
            let value = if config.is_null() {
                Value::Object(Default::default())
            } else {
                config.clone()
            };
            match serde_json::from_value::<T>(value) {
                Ok(cfg) => wrap(cfg),
                Err(e) => TaskKind::Unrecognized {
                    task_type: task_type.to_string(),
                    config: config.clone(),
                    reason: format!("invalid config: {e}"),
                },
            }
        }

        match task_type {
            Self::ARCHIVE_BY_QUERY => decode(task_type, config, TaskKind::ArchiveByQuery),
            Self::TRASH_BY_QUERY => decode(task_type, config, TaskKind::TrashByQuery),
            Self::UNSUBSCRIBE_SWEEP => decode(task_type, config, TaskKind::UnsubscribeSweep),
            Self::INBOX_STATS => decode(task_type, config, TaskKind::InboxStats),
            Self::LABEL_EMAILS => decode(task_type, config, TaskKind::LabelEmails),
            other => TaskKind::Unrecognized {
                task_type: other.to_string(),
                config: config.clone(),
                reason: "unknown task type".to_string(),
            },
        }
    }

    /// Task type tag as stored.
    pub fn task_type(&self) -> &str {
        match self {
            TaskKind::ArchiveByQuery(_) => Self::ARCHIVE_BY_QUERY,
            TaskKind::TrashByQuery(_) => Self::TRASH_BY_QUERY,
            TaskKind::UnsubscribeSweep(_) => Self::UNSUBSCRIBE_SWEEP,
            TaskKind::InboxStats(_) => Self::INBOX_STATS,
            TaskKind::LabelEmails(_) => Self::LABEL_EMAILS,
            TaskKind::Unrecognized { task_type, .. } => task_type,
        }
    }

    /// Config as stored. Unrecognized kinds keep their original payload.
    pub fn config_json(&self) -> Value {
        let encoded = match self {
            TaskKind::ArchiveByQuery(c) | TaskKind::TrashByQuery(c) => serde_json::to_value(c),
            TaskKind::UnsubscribeSweep(c) => serde_json::to_value(c),
            TaskKind::InboxStats(c) => serde_json::to_value(c),
            TaskKind::LabelEmails(c) => serde_json::to_value(c),
            TaskKind::Unrecognized { config, .. } => return config.clone(),
        };
        encoded.unwrap_or(Value::Null)
    }

    /// Checks ranges and required fields. Run once at creation time.
    pub fn validate(&self) -> Result<(), TaskConfigError> {
        match self {
            TaskKind::ArchiveByQuery(c) | TaskKind::TrashByQuery(c) => {
                non_empty("query", &c.query)?;
                in_range("max_results", c.max_results, 1, 500)
            }
            TaskKind::UnsubscribeSweep(c) => in_range("max_senders", c.max_senders, 1, 100),
            TaskKind::InboxStats(c) => {
                in_range("sample_size", c.sample_size, 1, 500)?;
                in_range("top_senders", c.top_senders, 1, 50)
            }
            TaskKind::LabelEmails(c) => {
                non_empty("query", &c.query)?;
                non_empty("label", &c.label)?;
                in_range("max_results", c.max_results, 1, 500)
            }
            TaskKind::Unrecognized {
                task_type, reason, ..
            } => Err(TaskConfigError::Unrecognized {
                task_type: task_type.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

fn non_empty(field: &'static str, value: &str) -> Result<(), TaskConfigError> {
    if value.trim().is_empty() {
        Err(TaskConfigError::EmptyField(field))
    } else {
        Ok(())
    }
}

fn in_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), TaskConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(TaskConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// Wire form of [`TaskKind`]: `{"task_type": "...", "config": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskKindRecord {
    pub task_type: String,
    #[serde(default)]
    pub config: Value,
}

impl From<TaskKindRecord> for TaskKind {
    fn from(record: TaskKindRecord) -> Self {
        TaskKind::from_parts(&record.task_type, &record.config)
    }
}

impl From<TaskKind> for TaskKindRecord {
    fn from(kind: TaskKind) -> Self {
        Self {
            task_type: kind.task_type().to_string(),
            config: kind.config_json(),
        }
    }
}

/// A user-owned scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTask {
    pub id: TaskId,
    pub user_id: UserId,
    pub title: String,
    pub kind: TaskKind,
    pub schedule: Schedule,
    pub enabled: bool,
    pub last_executed: Option<DateTime<Utc>>,
    /// Always strictly after the instant it was last computed from.
    pub next_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub kind: TaskKind,
    pub schedule: Schedule,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Append-only record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionLog {
    pub id: ExecutionLogId,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub status: ExecutionStatus,
    /// Task-type-specific summary.
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_known_types_with_defaults() {
        let kind = TaskKind::from_parts("archive_by_query", &json!({"query": "older_than:30d"}));
        assert_eq!(
            kind,
            TaskKind::ArchiveByQuery(QuerySweepConfig {
                query: "older_than:30d".to_string(),
                max_results: 100,
                protect_starred: true,
            })
        );

        let kind = TaskKind::from_parts("unsubscribe_sweep", &Value::Null);
        assert_eq!(kind, TaskKind::UnsubscribeSweep(UnsubscribeSweepConfig::default()));
    }

    #[test]
    fn unknown_type_is_unrecognized() {
        let config = json!({"foo": 1});
        let kind = TaskKind::from_parts("summarize_inbox", &config);
        match &kind {
            TaskKind::Unrecognized {
                task_type,
                config: kept,
                ..
            } => {
                assert_eq!(task_type, "summarize_inbox");
                assert_eq!(kept, &config);
            }
            other => panic!("expected unrecognized, got {other:?}"),
        }
        assert_eq!(kind.task_type(), "summarize_inbox");
        assert_eq!(kind.config_json(), config);
    }

    #[test]
    fn malformed_config_is_unrecognized() {
        let kind = TaskKind::from_parts("label_emails", &json!({"query": "from:x"}));
        assert!(matches!(kind, TaskKind::Unrecognized { .. }));
        assert!(matches!(
            kind.validate(),
            Err(TaskConfigError::Unrecognized { .. })
        ));
    }

    #[test]
    fn validation_checks_ranges_and_required_fields() {
        let mut cfg = QuerySweepConfig::new("");
        assert_eq!(
            TaskKind::TrashByQuery(cfg.clone()).validate(),
            Err(TaskConfigError::EmptyField("query"))
        );

        cfg.query = "is:read".to_string();
        cfg.max_results = 0;
        assert_eq!(
            TaskKind::TrashByQuery(cfg.clone()).validate(),
            Err(TaskConfigError::OutOfRange {
                field: "max_results",
                value: 0,
                min: 1,
                max: 500
            })
        );

        cfg.max_results = 500;
        assert!(TaskKind::TrashByQuery(cfg).validate().is_ok());

        let label = TaskKind::LabelEmails(LabelEmailsConfig {
            query: "from:news".to_string(),
            label: " ".to_string(),
            max_results: 10,
            archive: false,
        });
        assert_eq!(label.validate(), Err(TaskConfigError::EmptyField("label")));

        let stats = TaskKind::InboxStats(InboxStatsConfig {
            sample_size: 100,
            top_senders: 51,
        });
        assert!(stats.validate().is_err());
    }

    #[test]
    fn serde_uses_type_and_config_record() {
        let kind = TaskKind::LabelEmails(LabelEmailsConfig {
            query: "from:billing@example.com".to_string(),
            label: "Receipts".to_string(),
            max_results: 50,
            archive: true,
        });
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["task_type"], "label_emails");
        assert_eq!(json["config"]["label"], "Receipts");

        let back: TaskKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn execution_status_parses() {
        assert_eq!("failed".parse::<ExecutionStatus>(), Ok(ExecutionStatus::Failed));
        assert!("done".parse::<ExecutionStatus>().is_err());
    }
}
