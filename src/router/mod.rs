//! Provider-agnostic entry point for mailbox operations.
//!
//! Every operation resolves the user's connection, builds one adapter through
//! the [`ProviderFactory`] and dispatches to it. Operations the adapter cannot
//! express come back as [`Dispatched::Unsupported`] instead of an error.

mod context;
mod error;

pub use context::{CallContext, CallScope};
pub use error::{sanitize_error, truncate_chars, RouterError, MAX_ERROR_LEN};

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{
    EmailConnection, LabelChange, MailboxStats, MessageFlag, MessageId, OutgoingEmail,
    ProviderKind, UnsubscribeCandidate, UnsubscribeFailure, UnsubscribeReport, UserId,
};
use crate::providers::email::{Capability, MailProvider, ProviderError, ProviderFactory, SearchPage};
use crate::storage::ConnectionStore;

/// Result type for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Messages found by a scan plus query diagnostics.
pub type ScanResult = SearchPage;

/// The structured no-op returned for operations a provider cannot express.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Unsupported {
    pub provider: ProviderKind,
    pub operation: Capability,
}

/// Outcome of a dispatched operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatched<T> {
    Done(T),
    Unsupported(Unsupported),
}

impl<T> Dispatched<T> {
    pub fn done(self) -> Option<T> {
        match self {
            Dispatched::Done(value) => Some(value),
            Dispatched::Unsupported(_) => None,
        }
    }

    pub fn unsupported(&self) -> Option<&Unsupported> {
        match self {
            Dispatched::Done(_) => None,
            Dispatched::Unsupported(unsupported) => Some(unsupported),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Dispatched<U> {
        match self {
            Dispatched::Done(value) => Dispatched::Done(f(value)),
            Dispatched::Unsupported(unsupported) => Dispatched::Unsupported(unsupported),
        }
    }
}

/// Returns the no-op for `capability` if `provider` lacks it.
fn gate(provider: &dyn MailProvider, capability: Capability) -> Option<Unsupported> {
    if provider.capabilities().supports(capability) {
        return None;
    }
    debug!(provider = %provider.kind(), operation = %capability, "Operation unsupported");
    Some(Unsupported {
        provider: provider.kind(),
        operation: capability,
    })
}

macro_rules! gated {
    ($provider:expr, $capability:expr) => {
        if let Some(unsupported) = gate(&*$provider, $capability) {
            return Ok(Dispatched::Unsupported(unsupported));
        }
    };
}

/// Routes normalized operations to the user's preferred provider.
pub struct ProviderRouter {
    connections: Arc<dyn ConnectionStore>,
    factory: Arc<dyn ProviderFactory>,
}

impl ProviderRouter {
    pub fn new(connections: Arc<dyn ConnectionStore>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            connections,
            factory,
        }
    }

    async fn connection(&self, ctx: &CallContext, user_id: &UserId) -> Result<EmailConnection> {
        ctx.authorize(user_id)?;
        let connections = self
            .connections
            .connections_for_user(user_id)
            .await
            .map_err(|e| RouterError::Storage(sanitize_error(&e.to_string())))?;

        connections
            .into_iter()
            .min_by_key(|c| c.provider.preference_rank())
            .ok_or_else(|| RouterError::NoConnection(user_id.clone()))
    }

    async fn provider(&self, ctx: &CallContext, user_id: &UserId) -> Result<Box<dyn MailProvider>> {
        let connection = self.connection(ctx, user_id).await?;
        debug!(user_id = %user_id, provider = %connection.provider, "Selected provider");
        Ok(self.factory.build(connection))
    }

    /// Which provider calls for `user_id` would go to.
    pub async fn active_provider(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
    ) -> Result<ProviderKind> {
        Ok(self.connection(ctx, user_id).await?.provider)
    }

    /// Searches with a Gmail-style query.
    pub async fn scan_inbox(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
        query: &str,
        max: u32,
    ) -> Result<Dispatched<ScanResult>> {
        let provider = self.provider(ctx, user_id).await?;
        gated!(provider, Capability::Search);
        let page = provider
            .search(query, max)
            .await
            .map_err(|e| RouterError::from_provider(provider.kind(), e))?;
        if !page.unsupported.is_empty() {
            debug!(
                user_id = %user_id,
                unsupported = ?page.unsupported,
                "Query fragments dropped during translation"
            );
        }
        Ok(Dispatched::Done(page))
    }

    pub async fn send_message(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
        email: &OutgoingEmail,
    ) -> Result<Dispatched<String>> {
        let provider = self.provider(ctx, user_id).await?;
        gated!(provider, Capability::Send);
        let id = provider
            .send(email)
            .await
            .map_err(|e| RouterError::from_provider(provider.kind(), e))?;
        info!(user_id = %user_id, provider = %provider.kind(), "Message sent");
        Ok(Dispatched::Done(id))
    }

    pub async fn create_draft(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
        email: &OutgoingEmail,
    ) -> Result<Dispatched<String>> {
        let provider = self.provider(ctx, user_id).await?;
        gated!(provider, Capability::Drafts);
        let id = provider
            .create_draft(email)
            .await
            .map_err(|e| RouterError::from_provider(provider.kind(), e))?;
        Ok(Dispatched::Done(id))
    }

    /// Adds and removes labels by name.
    ///
    /// Needs the add capability when `add` is non-empty and the remove
    /// capability when `remove` is non-empty.
    pub async fn apply_labels(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
        ids: &[MessageId],
        add: &[String],
        remove: &[String],
    ) -> Result<Dispatched<LabelChange>> {
        let provider = self.provider(ctx, user_id).await?;
        if !add.is_empty() {
            gated!(provider, Capability::AddLabels);
        }
        if !remove.is_empty() {
            gated!(provider, Capability::RemoveLabels);
        }
        if ids.is_empty() || (add.is_empty() && remove.is_empty()) {
            return Ok(Dispatched::Done(LabelChange::default()));
        }
        let change = provider
            .apply_labels(ids, add, remove, ctx.cache())
            .await
            .map_err(|e| RouterError::from_provider(provider.kind(), e))?;
        Ok(Dispatched::Done(change))
    }

    pub async fn mark_read(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
        ids: &[MessageId],
        read: bool,
    ) -> Result<Dispatched<usize>> {
        let provider = self.provider(ctx, user_id).await?;
        gated!(provider, Capability::Flags);
        if ids.is_empty() {
            return Ok(Dispatched::Done(0));
        }
        let unread = [MessageFlag::Unread];
        let none: [MessageFlag; 0] = [];
        let (add, remove) = if read {
            (&none[..], &unread[..])
        } else {
            (&unread[..], &none[..])
        };
        let count = provider
            .modify_flags(ids, add, remove)
            .await
            .map_err(|e| RouterError::from_provider(provider.kind(), e))?;
        Ok(Dispatched::Done(count))
    }

    pub async fn archive(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
        ids: &[MessageId],
    ) -> Result<Dispatched<usize>> {
        let provider = self.provider(ctx, user_id).await?;
        gated!(provider, Capability::Archive);
        if ids.is_empty() {
            return Ok(Dispatched::Done(0));
        }
        let count = provider
            .archive(ids)
            .await
            .map_err(|e| RouterError::from_provider(provider.kind(), e))?;
        info!(user_id = %user_id, count, "Archived messages");
        Ok(Dispatched::Done(count))
    }

    pub async fn trash(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
        ids: &[MessageId],
    ) -> Result<Dispatched<usize>> {
        let provider = self.provider(ctx, user_id).await?;
        gated!(provider, Capability::Trash);
        if ids.is_empty() {
            return Ok(Dispatched::Done(0));
        }
        let count = provider
            .trash(ids)
            .await
            .map_err(|e| RouterError::from_provider(provider.kind(), e))?;
        info!(user_id = %user_id, count, "Trashed messages");
        Ok(Dispatched::Done(count))
    }

    pub async fn find_unsubscribable(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
        max: u32,
    ) -> Result<Dispatched<Vec<UnsubscribeCandidate>>> {
        let provider = self.provider(ctx, user_id).await?;
        gated!(provider, Capability::Unsubscribe);
        let candidates = provider
            .find_unsubscribable(max)
            .await
            .map_err(|e| RouterError::from_provider(provider.kind(), e))?;
        Ok(Dispatched::Done(candidates))
    }

    /// Unsubscribes from each candidate in turn.
    ///
    /// Per-sender failures land in the report. An expired authorization
    /// aborts the remaining candidates.
    pub async fn bulk_unsubscribe(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
        candidates: &[UnsubscribeCandidate],
    ) -> Result<Dispatched<UnsubscribeReport>> {
        let provider = self.provider(ctx, user_id).await?;
        gated!(provider, Capability::Unsubscribe);

        let mut report = UnsubscribeReport::default();
        for candidate in candidates {
            report.attempted += 1;
            match provider.unsubscribe(candidate).await {
                Ok(()) => report.succeeded.push(candidate.sender.email.clone()),
                Err(ProviderError::AuthExpired(message)) => {
                    return Err(RouterError::from_provider(
                        provider.kind(),
                        ProviderError::AuthExpired(message),
                    ));
                }
                Err(e) => {
                    let reason = sanitize_error(&e.to_string());
                    warn!(
                        user_id = %user_id,
                        sender = %candidate.sender.email,
                        error = %reason,
                        "Unsubscribe failed"
                    );
                    report.failed.push(UnsubscribeFailure {
                        sender: candidate.sender.email.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(Dispatched::Done(report))
    }

    pub async fn get_stats(
        &self,
        ctx: &CallContext,
        user_id: &UserId,
    ) -> Result<Dispatched<MailboxStats>> {
        let provider = self.provider(ctx, user_id).await?;
        gated!(provider, Capability::Stats);
        let stats = provider
            .stats()
            .await
            .map_err(|e| RouterError::from_provider(provider.kind(), e))?;
        Ok(Dispatched::Done(stats))
    }
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter").finish_non_exhaustive()
    }
}
