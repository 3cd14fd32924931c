//! Connecting and disconnecting mailboxes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::{ConnectionSummary, EmailConnection, ProviderKind, UserId};
use crate::providers::email::RequestCache;
use crate::storage::ConnectionStore;
use crate::vault::TokenManager;

use super::Result;

pub struct ConnectionService {
    tokens: Arc<TokenManager>,
    connections: Arc<dyn ConnectionStore>,
    cache: Arc<RequestCache>,
}

impl ConnectionService {
    pub fn new(
        tokens: Arc<TokenManager>,
        connections: Arc<dyn ConnectionStore>,
        cache: Arc<RequestCache>,
    ) -> Self {
        Self {
            tokens,
            connections,
            cache,
        }
    }

    /// Exchanges an authorization code and stores the encrypted tokens.
    ///
    /// Reconnecting replaces the previous connection. If the provider returns
    /// no refresh token the previously stored one is kept.
    pub async fn connect(
        &self,
        user_id: &UserId,
        provider: ProviderKind,
        account_email: &str,
        code: &str,
        redirect_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<ConnectionSummary> {
        let tokens = self
            .tokens
            .oauth()
            .exchange_code(provider, code, redirect_uri)
            .await?;
        let sealed = self.tokens.seal(&tokens)?;
        let existing = self.connections.get_connection(user_id, provider).await?;

        let connection = EmailConnection {
            user_id: user_id.clone(),
            provider,
            account_email: account_email.to_string(),
            access_token_enc: sealed.access_token_enc,
            refresh_token_enc: sealed
                .refresh_token_enc
                .or_else(|| existing.as_ref().and_then(|c| c.refresh_token_enc.clone())),
            expires_at: sealed.expires_at,
            created_at: existing.as_ref().map(|c| c.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.connections.upsert_connection(&connection).await?;
        self.cache.forget(user_id, provider);
        info!(user_id = %user_id, provider = %provider, "Connected mailbox");
        Ok(ConnectionSummary::from(&connection))
    }

    /// Returns whether a connection existed.
    pub async fn disconnect(&self, user_id: &UserId, provider: ProviderKind) -> Result<bool> {
        let removed = self.connections.delete_connection(user_id, provider).await?;
        self.cache.forget(user_id, provider);
        if removed {
            info!(user_id = %user_id, provider = %provider, "Disconnected mailbox");
        }
        Ok(removed)
    }

    /// Connections in routing preference order, without tokens.
    pub async fn list(&self, user_id: &UserId) -> Result<Vec<ConnectionSummary>> {
        let mut connections = self.connections.connections_for_user(user_id).await?;
        connections.sort_by_key(|c| c.provider.preference_rank());
        Ok(connections.iter().map(ConnectionSummary::from).collect())
    }
}
