//! One-off emails sent later by the runner.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::{
    NewScheduledEmail, ScheduledEmail, ScheduledEmailId, ScheduledStatus, UserId,
};
use crate::storage::ScheduledEmailStore;

use super::{Result, ServiceError};

pub struct ScheduledEmailService {
    emails: Arc<dyn ScheduledEmailStore>,
}

impl ScheduledEmailService {
    pub fn new(emails: Arc<dyn ScheduledEmailStore>) -> Self {
        Self { emails }
    }

    /// Stores an email for sending at `new.scheduled_at`.
    ///
    /// Needs at least one recipient, every address valid, and an instant
    /// after `now`.
    pub async fn schedule(
        &self,
        user_id: &UserId,
        new: NewScheduledEmail,
        now: DateTime<Utc>,
    ) -> Result<ScheduledEmail> {
        if new.to.is_empty() {
            return Err(ServiceError::InvalidEmail("no recipients".to_string()));
        }
        if let Some(bad) = new.to.iter().find(|a| !a.is_valid()) {
            return Err(ServiceError::InvalidEmail(format!(
                "invalid recipient address: {}",
                bad
            )));
        }
        if new.scheduled_at <= now {
            return Err(ServiceError::InvalidEmail(
                "scheduled time must be in the future".to_string(),
            ));
        }

        let email = ScheduledEmail {
            id: ScheduledEmailId::generate(),
            user_id: user_id.clone(),
            to: new.to,
            subject: new.subject,
            body: new.body,
            thread_id: new.thread_id,
            scheduled_at: new.scheduled_at,
            status: ScheduledStatus::Scheduled,
            error: None,
            provider_message_id: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };
        self.emails.insert_scheduled(&email).await?;
        info!(
            email_id = %email.id,
            user_id = %user_id,
            scheduled_at = %email.scheduled_at,
            "Scheduled email"
        );
        Ok(email)
    }

    /// Cancels an email that has not been picked up yet.
    pub async fn cancel(&self, user_id: &UserId, id: &ScheduledEmailId) -> Result<()> {
        if self.emails.cancel_scheduled(id, user_id).await? {
            info!(email_id = %id, user_id = %user_id, "Canceled scheduled email");
            return Ok(());
        }
        match self.emails.get_scheduled(id).await? {
            Some(email) if &email.user_id == user_id => Err(ServiceError::NotCancelable {
                id: id.clone(),
                status: email.status,
            }),
            _ => Err(ServiceError::NotFound(id.to_string())),
        }
    }

    pub async fn list(&self, user_id: &UserId) -> Result<Vec<ScheduledEmail>> {
        Ok(self.emails.list_scheduled(user_id).await?)
    }
}
