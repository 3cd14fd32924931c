//! Process settings and configuration types.
//!
//! Settings are read from `settings.json` in the user's config directory (or
//! the file named by `MAILSWEEP_CONFIG`). Secrets never live in this file;
//! they come from the environment or the OS keychain.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::ProviderKind;

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite location.
    pub database: DatabaseSettings,
    /// Cron runner batching and polling.
    pub runner: RunnerSettings,
    /// Task executor limits.
    pub executor: ExecutorSettings,
    /// OAuth clients per provider.
    pub providers: ProvidersSettings,
    /// Where secrets are read from.
    pub security: SecuritySettings,
}

/// Database configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Database file. Defaults to `mailsweep.db` in the data directory.
    pub path: Option<PathBuf>,
}

/// Cron runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Maximum recurring tasks processed per invocation.
    pub task_batch_size: usize,
    /// Maximum scheduled emails processed per invocation.
    pub email_batch_size: usize,
    /// Seconds between recurring task polls.
    pub task_poll_interval_secs: u64,
    /// Seconds between scheduled email polls.
    pub email_poll_interval_secs: u64,
    /// Persisted error messages are truncated to this many characters.
    pub error_max_len: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            task_batch_size: 50,
            email_batch_size: 50,
            task_poll_interval_secs: 60,
            email_poll_interval_secs: 30,
            error_max_len: 500,
        }
    }
}

/// Task executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Upper bound applied on top of each task's own `max_results`.
    pub max_results_cap: u32,
    /// Messages scanned per sender when looking for unsubscribe links.
    pub unsubscribe_scan_size: u32,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_results_cap: 500,
            unsubscribe_scan_size: 200,
        }
    }
}

/// OAuth configuration for all providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersSettings {
    pub google: OAuthProviderSettings,
    pub microsoft: OAuthProviderSettings,
}

impl ProvidersSettings {
    /// Settings for one provider.
    pub fn get(&self, provider: ProviderKind) -> &OAuthProviderSettings {
        match provider {
            ProviderKind::Gmail => &self.google,
            ProviderKind::Outlook => &self.microsoft,
        }
    }

    pub fn get_mut(&mut self, provider: ProviderKind) -> &mut OAuthProviderSettings {
        match provider {
            ProviderKind::Gmail => &mut self.google,
            ProviderKind::Outlook => &mut self.microsoft,
        }
    }
}

impl Default for ProvidersSettings {
    fn default() -> Self {
        Self {
            google: OAuthProviderSettings {
                client_id: String::new(),
                client_secret: None,
                auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                redirect_uri: None,
                scopes: vec![
                    "https://www.googleapis.com/auth/gmail.modify".to_string(),
                    "https://www.googleapis.com/auth/gmail.send".to_string(),
                    "https://www.googleapis.com/auth/userinfo.email".to_string(),
                ],
            },
            microsoft: OAuthProviderSettings {
                client_id: String::new(),
                client_secret: None,
                auth_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize"
                    .to_string(),
                token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
                redirect_uri: None,
                scopes: vec![
                    "offline_access".to_string(),
                    "https://graph.microsoft.com/Mail.ReadWrite".to_string(),
                    "https://graph.microsoft.com/Mail.Send".to_string(),
                    "https://graph.microsoft.com/MailboxSettings.Read".to_string(),
                    "https://graph.microsoft.com/User.Read".to_string(),
                ],
            },
        }
    }
}

/// OAuth client registration for one provider.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthProviderSettings {
    pub client_id: String,
    /// Filled from the environment or keychain; never written back to disk.
    #[serde(skip_serializing, default)]
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    /// Default redirect URI for the authorization-code flow.
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthProviderSettings {
    /// Whether a client id has been configured.
    pub fn is_configured(&self) -> bool {
        !self.client_id.trim().is_empty()
    }
}

impl std::fmt::Debug for OAuthProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProviderSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Secret sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Fall back to the OS keychain for secrets missing from the environment.
    pub use_keychain: bool,
    /// Keychain service namespace.
    pub keychain_service: String,
    /// Generate and store a vault key in the keychain if none exists.
    pub create_vault_key: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            use_keychain: true,
            keychain_service: "io.mailsweep.core".to_string(),
            create_vault_key: false,
        }
    }
}
