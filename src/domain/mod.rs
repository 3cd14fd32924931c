//! Domain layer types for mailsweep.
//!
//! This module contains the core domain types shared by the router, the
//! executor and the runner: connections, normalized messages, recurring
//! tasks and scheduled emails.

mod connection;
mod message;
mod scheduled;
mod task;
mod types;

pub use connection::{ConnectionSummary, EmailConnection, ProviderKind};
pub use message::{
    Address, LabelChange, MailboxStats, MessageFlag, NormalizedMessage, OutgoingEmail,
    UnsubscribeCandidate, UnsubscribeFailure, UnsubscribeMethod, UnsubscribeReport,
};
pub use scheduled::{NewScheduledEmail, ScheduledEmail, ScheduledStatus};
pub use task::{
    ExecutionStatus, InboxStatsConfig, LabelEmailsConfig, NewTask, QuerySweepConfig,
    RecurringTask, TaskConfigError, TaskExecutionLog, TaskKind, TaskKindRecord,
    UnsubscribeSweepConfig,
};
pub use types::{ExecutionLogId, MessageId, ScheduledEmailId, TaskId, ThreadId, UserId};
