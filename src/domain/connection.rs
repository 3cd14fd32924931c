//! Email connection domain types.
//!
//! A connection binds one user to one OAuth email provider. Tokens are kept
//! in their encrypted at-rest form; only the token manager decrypts them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// Supported email providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Gmail REST API.
    Gmail,
    /// Microsoft Graph (Outlook / Microsoft 365).
    Outlook,
}

impl ProviderKind {
    /// Order in which providers are chosen when a user has several connections.
    ///
    /// The first connected provider in this list handles every routed call.
    pub const PREFERENCE: [ProviderKind; 2] = [ProviderKind::Gmail, ProviderKind::Outlook];

    /// Returns the storage tag for this provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Outlook => "outlook",
        }
    }

    /// Position in [`ProviderKind::PREFERENCE`]; lower wins.
    pub fn preference_rank(&self) -> usize {
        Self::PREFERENCE
            .iter()
            .position(|p| p == self)
            .unwrap_or(Self::PREFERENCE.len())
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(ProviderKind::Gmail),
            "outlook" | "microsoft" => Ok(ProviderKind::Outlook),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// A user's OAuth connection to one email provider.
#[derive(Clone, PartialEq, Eq)]
pub struct EmailConnection {
    /// Owner of the connection.
    pub user_id: UserId,
    /// Provider this connection authenticates against.
    pub provider: ProviderKind,
    /// Mailbox address reported by the provider.
    pub account_email: String,
    /// Access token, encrypted by the credential vault.
    pub access_token_enc: String,
    /// Refresh token, encrypted by the credential vault.
    pub refresh_token_enc: Option<String>,
    /// When the access token stops being valid.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the connection was first created.
    pub created_at: DateTime<Utc>,
    /// When the connection was last modified (e.g. token refresh).
    pub updated_at: DateTime<Utc>,
}

impl EmailConnection {
    /// Returns whether the access token must be refreshed before use.
    ///
    /// `skew` treats tokens that expire within that window as already expired.
    /// A connection without a known expiry is considered valid.
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + skew,
            None => false,
        }
    }
}

impl fmt::Debug for EmailConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailConnection")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("account_email", &self.account_email)
            .field("access_token_enc", &"<redacted>")
            .field(
                "refresh_token_enc",
                &self.refresh_token_enc.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token-free view of a connection, safe to return to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub user_id: UserId,
    pub provider: ProviderKind,
    pub account_email: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&EmailConnection> for ConnectionSummary {
    fn from(conn: &EmailConnection) -> Self {
        Self {
            user_id: conn.user_id.clone(),
            provider: conn.provider,
            account_email: conn.account_email.clone(),
            expires_at: conn.expires_at,
            created_at: conn.created_at,
            updated_at: conn.updated_at,
        }
    }
}
