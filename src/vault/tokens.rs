//! OAuth token exchange and per-request access token resolution.
//!
//! [`TokenManager::access_token`] is called before every provider request.
//! Expired tokens are refreshed through the [`OAuthClient`] and the new pair is
//! persisted encrypted before it is used.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope, TokenUrl};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cipher::{CredentialVault, VaultError};
use crate::config::{OAuthProviderSettings, ProvidersSettings};
use crate::domain::{EmailConnection, ProviderKind};
use crate::storage::{ConnectionStore, StoreError};

/// Tokens closer than this to expiry are refreshed before use.
pub const DEFAULT_REFRESH_SKEW_SECS: i64 = 60;

/// Plaintext tokens returned by a provider token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    /// Absent when the provider keeps the previous refresh token valid.
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A [`TokenSet`] in its at-rest form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedTokens {
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Errors from the provider token endpoints.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("OAuth client for {0} is not configured")]
    NotConfigured(ProviderKind),

    #[error("token endpoint rejected the request: {0}")]
    Rejected(String),

    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    #[error("invalid OAuth configuration: {0}")]
    InvalidConfig(String),
}

/// Provider token endpoint operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// Exchanges an authorization code for tokens.
    async fn exchange_code(
        &self,
        provider: ProviderKind,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, OAuthError>;

    /// Obtains a fresh access token from a refresh token.
    async fn refresh(
        &self,
        provider: ProviderKind,
        refresh_token: &str,
    ) -> Result<TokenSet, OAuthError>;
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    #[allow(dead_code)]
    #[serde(default)]
    token_type: String,
}

impl TokenResponse {
    fn into_token_set(self, issued_at: DateTime<Utc>) -> TokenSet {
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .map(|secs| issued_at + Duration::seconds(secs as i64)),
        }
    }
}

/// [`OAuthClient`] backed by the Google and Microsoft identity platforms.
#[derive(Debug, Clone)]
pub struct OAuth2Client {
    http: reqwest::Client,
    providers: ProvidersSettings,
}

impl OAuth2Client {
    pub fn new(providers: ProvidersSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            providers,
        }
    }

    fn configured(&self, provider: ProviderKind) -> Result<&OAuthProviderSettings, OAuthError> {
        let settings = self.providers.get(provider);
        if !settings.is_configured() {
            return Err(OAuthError::NotConfigured(provider));
        }
        Ok(settings)
    }

    /// Builds the consent URL a user visits to connect a mailbox.
    ///
    /// Returns the URL and the CSRF state the callback must echo back.
    pub fn authorize_url(
        &self,
        provider: ProviderKind,
        redirect_uri: Option<&str>,
    ) -> Result<(url::Url, String), OAuthError> {
        let settings = self.configured(provider)?;
        let redirect = redirect_uri
            .map(str::to_string)
            .or_else(|| settings.redirect_uri.clone())
            .ok_or_else(|| OAuthError::InvalidConfig("redirect_uri is required".to_string()))?;

        let auth_url = AuthUrl::new(settings.auth_url.clone())
            .map_err(|e| OAuthError::InvalidConfig(e.to_string()))?;
        let token_url = TokenUrl::new(settings.token_url.clone())
            .map_err(|e| OAuthError::InvalidConfig(e.to_string()))?;
        let redirect =
            RedirectUrl::new(redirect).map_err(|e| OAuthError::InvalidConfig(e.to_string()))?;

        let client = BasicClient::new(
            ClientId::new(settings.client_id.clone()),
            settings.client_secret.clone().map(ClientSecret::new),
            auth_url,
            Some(token_url),
        )
        .set_redirect_uri(redirect);

        let mut request = client.authorize_url(CsrfToken::new_random);
        for scope in &settings.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        // Google only returns a refresh token with offline access and consent.
        if provider == ProviderKind::Gmail {
            request = request
                .add_extra_param("access_type", "offline")
                .add_extra_param("prompt", "consent");
        }

        let (url, state) = request.url();
        Ok((url, state.secret().clone()))
    }

    async fn token_request(
        &self,
        provider: ProviderKind,
        params: &[(&str, &str)],
    ) -> Result<TokenSet, OAuthError> {
        let settings = self.configured(provider)?;

        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("client_id", settings.client_id.as_str()));
        if let Some(secret) = &settings.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let issued_at = Utc::now();
        let response = self
            .http
            .post(&settings.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| OAuthError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Rejected(format!("{status}: {body}")));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::Rejected(format!("parse token response: {e}")))?;

        Ok(token_response.into_token_set(issued_at))
    }
}

#[async_trait]
impl OAuthClient for OAuth2Client {
    async fn exchange_code(
        &self,
        provider: ProviderKind,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, OAuthError> {
        debug!(provider = %provider, "Exchanging authorization code");
        self.token_request(
            provider,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
        )
        .await
    }

    async fn refresh(
        &self,
        provider: ProviderKind,
        refresh_token: &str,
    ) -> Result<TokenSet, OAuthError> {
        debug!(provider = %provider, "Refreshing access token");
        self.token_request(
            provider,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }
}

/// Errors raised while resolving an access token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The user must reconnect the mailbox.
    #[error("authorization expired: {0}")]
    AuthExpired(String),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("failed to persist refreshed tokens: {0}")]
    Store(#[from] StoreError),
}

/// Resolves usable access tokens for connections.
#[derive(Clone)]
pub struct TokenManager {
    vault: CredentialVault,
    oauth: Arc<dyn OAuthClient>,
    connections: Arc<dyn ConnectionStore>,
    skew: Duration,
}

impl TokenManager {
    pub fn new(
        vault: CredentialVault,
        oauth: Arc<dyn OAuthClient>,
        connections: Arc<dyn ConnectionStore>,
    ) -> Self {
        Self {
            vault,
            oauth,
            connections,
            skew: Duration::seconds(DEFAULT_REFRESH_SKEW_SECS),
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn oauth(&self) -> &Arc<dyn OAuthClient> {
        &self.oauth
    }

    /// Encrypts a token set for storage.
    pub fn seal(&self, tokens: &TokenSet) -> Result<SealedTokens, TokenError> {
        Ok(SealedTokens {
            access_token_enc: self.vault.encrypt(&tokens.access_token)?,
            refresh_token_enc: tokens
                .refresh_token
                .as_deref()
                .map(|t| self.vault.encrypt(t))
                .transpose()?,
            expires_at: tokens.expires_at,
        })
    }

    /// Returns a plaintext access token for `connection`, refreshing first if
    /// the stored one is expired or about to expire.
    ///
    /// A refreshed pair is persisted before it is returned. If the refresh
    /// fails nothing is written and the stale token is not used.
    pub async fn access_token(&self, connection: &EmailConnection) -> Result<String, TokenError> {
        if !connection.needs_refresh(Utc::now(), self.skew) {
            return Ok(self.vault.decrypt_with_fallback(&connection.access_token_enc));
        }

        let Some(refresh_enc) = connection.refresh_token_enc.as_deref() else {
            warn!(
                user_id = %connection.user_id,
                provider = %connection.provider,
                "Access token expired and no refresh token is stored"
            );
            return Err(TokenError::AuthExpired("no refresh token".to_string()));
        };
        let refresh_token = self.vault.decrypt_with_fallback(refresh_enc);

        let tokens = self
            .oauth
            .refresh(connection.provider, &refresh_token)
            .await
            .map_err(|e| {
                warn!(
                    user_id = %connection.user_id,
                    provider = %connection.provider,
                    error = %e,
                    "Token refresh failed"
                );
                TokenError::AuthExpired(e.to_string())
            })?;

        let sealed = self.seal(&tokens)?;
        self.connections
            .update_tokens(
                &connection.user_id,
                connection.provider,
                &sealed.access_token_enc,
                sealed.refresh_token_enc.as_deref(),
                sealed.expires_at,
            )
            .await?;

        info!(
            user_id = %connection.user_id,
            provider = %connection.provider,
            "Refreshed access token"
        );
        Ok(tokens.access_token)
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("vault", &self.vault)
            .field("skew", &self.skew)
            .finish_non_exhaustive()
    }
}
