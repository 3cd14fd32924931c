//! Business services layer.
//!
//! Services sit between the entry points (the binary's runner loop, or any
//! host that embeds the crate) and the infrastructure:
//!
//! ```text
//! Entry points (cron trigger, API handlers)
//!          |
//!          v
//!    Services Layer  <-- You are here
//!          |
//!          v
//! Router, Providers, Storage
//! ```
//!
//! # Services Overview
//!
//! - [`TaskExecutor`]: runs one recurring task through the router
//! - [`CronRunner`]: authorizes and processes due tasks and scheduled emails
//! - [`TaskService`], [`ScheduledEmailService`], [`ConnectionService`]:
//!   user-facing management of tasks, scheduled sends and mailboxes

mod connection_service;
mod executor;
mod runner;
mod scheduled_email_service;
mod task_service;

pub use connection_service::ConnectionService;
pub use executor::{TaskExecutor, TaskOutcome};
pub use runner::{CronRunner, ItemResult, ItemStatus, RunSummary, RunnerError};
pub use scheduled_email_service::ScheduledEmailService;
pub use task_service::TaskService;

use thiserror::Error;

use crate::domain::{ScheduledEmailId, ScheduledStatus, TaskConfigError};
use crate::schedule::ScheduleError;
use crate::storage::StoreError;
use crate::vault::{OAuthError, TokenError};

/// Errors returned by the management services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid task: {0}")]
    InvalidTask(#[from] TaskConfigError),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    #[error("invalid email: {0}")]
    InvalidEmail(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("scheduled email {id} is {status} and can no longer be canceled")]
    NotCancelable {
        id: ScheduledEmailId,
        status: ScheduledStatus,
    },

    #[error("OAuth error: {0}")]
    OAuth(#[from] OAuthError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
