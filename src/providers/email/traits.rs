//! Mail provider trait definition.
//!
//! This module defines the [`MailProvider`] trait which abstracts over the
//! supported mailbox APIs (Gmail REST, Microsoft Graph). Every adapter
//! normalizes its responses into the shared domain types.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::cache::RequestCache;
use crate::domain::{
    LabelChange, MailboxStats, MessageFlag, MessageId, NormalizedMessage, OutgoingEmail,
    ProviderKind, UnsubscribeCandidate,
};
use crate::vault::TokenError;

/// Result type alias for mail provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur during mail provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The connection's tokens can no longer be refreshed.
    #[error("authorization expired: {0}")]
    AuthExpired(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// Seconds to wait before retrying, if known.
        retry_after_secs: Option<u64>,
    },

    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Error status returned by the provider API.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Refreshed tokens could not be persisted.
    #[error("storage error: {0}")]
    Storage(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for ProviderError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::AuthExpired(msg) => ProviderError::AuthExpired(msg),
            TokenError::Store(e) => ProviderError::Storage(e.to_string()),
            TokenError::Vault(e) => ProviderError::Internal(e.to_string()),
        }
    }
}

/// A normalized operation an adapter may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Search,
    Send,
    Drafts,
    Flags,
    AddLabels,
    RemoveLabels,
    Archive,
    Trash,
    Unsubscribe,
    Stats,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Search => "search",
            Capability::Send => "send",
            Capability::Drafts => "drafts",
            Capability::Flags => "flags",
            Capability::AddLabels => "add_labels",
            Capability::RemoveLabels => "remove_labels",
            Capability::Archive => "archive",
            Capability::Trash => "trash",
            Capability::Unsubscribe => "unsubscribe",
            Capability::Stats => "stats",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of operations an adapter supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(&'static [Capability]);

impl Capabilities {
    pub const fn new(supported: &'static [Capability]) -> Self {
        Self(supported)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub messages: Vec<NormalizedMessage>,
    /// The query as sent to the provider.
    pub native_query: String,
    /// Query fragments the provider could not express.
    pub unsupported: Vec<String>,
}

/// Trait for mailbox API adapters.
///
/// An adapter is bound to one connection. Mutations are idempotent: applying
/// the same change twice to the same ids succeeds both times.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Returns the provider this adapter talks to.
    fn kind(&self) -> ProviderKind;

    /// Returns the operations this adapter supports.
    fn capabilities(&self) -> Capabilities;

    /// Searches messages with a Gmail-style query, newest first.
    async fn search(&self, query: &str, max: u32) -> Result<SearchPage>;

    /// Sends an email. Returns the provider message id.
    async fn send(&self, email: &OutgoingEmail) -> Result<String>;

    /// Saves a draft. Returns the provider draft id.
    async fn create_draft(&self, email: &OutgoingEmail) -> Result<String>;

    /// Adds and removes flags. Returns the number of messages touched.
    async fn modify_flags(
        &self,
        ids: &[MessageId],
        add: &[MessageFlag],
        remove: &[MessageFlag],
    ) -> Result<usize>;

    /// Adds and removes labels by name, creating missing labels.
    ///
    /// `cache` memoizes label name to provider id lookups.
    async fn apply_labels(
        &self,
        ids: &[MessageId],
        add: &[String],
        remove: &[String],
        cache: &RequestCache,
    ) -> Result<LabelChange>;

    /// Removes messages from the inbox.
    async fn archive(&self, ids: &[MessageId]) -> Result<usize>;

    /// Moves messages to the trash.
    async fn trash(&self, ids: &[MessageId]) -> Result<usize>;

    /// Scans recent mail for senders with an unsubscribe mechanism.
    async fn find_unsubscribable(&self, max: u32) -> Result<Vec<UnsubscribeCandidate>>;

    /// Unsubscribes from one sender using the best available method.
    async fn unsubscribe(&self, candidate: &UnsubscribeCandidate) -> Result<()>;

    /// Returns mailbox counters.
    async fn stats(&self) -> Result<MailboxStats>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;

    #[test]
    fn capabilities_membership() {
        const CAPS: Capabilities = Capabilities::new(&[Capability::Search, Capability::Archive]);
        assert!(CAPS.supports(Capability::Archive));
        assert!(!CAPS.supports(Capability::RemoveLabels));
    }

    #[test]
    fn token_errors_map_to_provider_errors() {
        let err: ProviderError = TokenError::AuthExpired("invalid_grant".to_string()).into();
        assert!(matches!(err, ProviderError::AuthExpired(_)));

        let err: ProviderError =
            TokenError::Store(StoreError::NotFound("connection".into())).into();
        assert!(matches!(err, ProviderError::Storage(_)));
    }

    #[test]
    fn provider_error_display() {
        let err = ProviderError::Api {
            status: 500,
            message: "backend".to_string(),
        };
        assert_eq!(err.to_string(), "API error (500): backend");

        let err = ProviderError::RateLimited {
            retry_after_secs: Some(30),
        };
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn capability_serializes_snake_case() {
        let json = serde_json::to_string(&Capability::RemoveLabels).unwrap();
        assert_eq!(json, "\"remove_labels\"");
    }
}
