//! Scheduled email domain types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Address, OutgoingEmail, ScheduledEmailId, ThreadId, UserId};

/// Lifecycle of a scheduled email.
///
/// `scheduled → sending → sent | failed`, or `scheduled → canceled`.
/// Once a row leaves `scheduled` it never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledStatus {
    Scheduled,
    Sending,
    Sent,
    Failed,
    Canceled,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledStatus::Scheduled => "scheduled",
            ScheduledStatus::Sending => "sending",
            ScheduledStatus::Sent => "sent",
            ScheduledStatus::Failed => "failed",
            ScheduledStatus::Canceled => "canceled",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduledStatus::Sent | ScheduledStatus::Failed | ScheduledStatus::Canceled
        )
    }
}

impl fmt::Display for ScheduledStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduledStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ScheduledStatus::Scheduled),
            "sending" => Ok(ScheduledStatus::Sending),
            "sent" => Ok(ScheduledStatus::Sent),
            "failed" => Ok(ScheduledStatus::Failed),
            // Older rows used the double-l spelling.
            "canceled" | "cancelled" => Ok(ScheduledStatus::Canceled),
            other => Err(format!("unknown scheduled email status: {other}")),
        }
    }
}

/// A user-authored email with a future send instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEmail {
    pub id: ScheduledEmailId,
    pub user_id: UserId,
    pub to: Vec<Address>,
    pub subject: String,
    pub body: String,
    /// Thread the email replies into, if any.
    pub thread_id: Option<ThreadId>,
    pub scheduled_at: DateTime<Utc>,
    pub status: ScheduledStatus,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledEmail {
    /// Builds the provider-independent message to send.
    pub fn to_outgoing(&self) -> OutgoingEmail {
        let mut email =
            OutgoingEmail::new(self.to.clone(), self.subject.clone(), self.body.clone());
        email.in_reply_to_thread = self.thread_id.clone();
        email
    }
}

/// Input for scheduling an email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewScheduledEmail {
    pub to: Vec<Address>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
    pub scheduled_at: DateTime<Utc>,
}
