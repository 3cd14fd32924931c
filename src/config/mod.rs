//! Configuration and settings management.
//!
//! This module provides settings types, the JSON loader and secret
//! resolution. Settings are stored in the user's config directory as JSON;
//! secrets come from the environment first and the OS keychain second.

mod settings;

use std::fmt;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::ProviderKind;
use crate::storage::{KeychainAccess, KeychainError, SecretSlot};
use crate::vault::CredentialVault;

pub use settings::{
    DatabaseSettings, ExecutorSettings, OAuthProviderSettings, ProvidersSettings, RunnerSettings,
    SecuritySettings, Settings,
};

/// Overrides the settings file location.
pub const CONFIG_ENV: &str = "MAILSWEEP_CONFIG";
/// Base64-encoded 32-byte vault key.
pub const VAULT_KEY_ENV: &str = "MAILSWEEP_VAULT_KEY";
/// Shared secret presented by runner invocations.
pub const CRON_SECRET_ENV: &str = "MAILSWEEP_CRON_SECRET";
pub const GOOGLE_CLIENT_SECRET_ENV: &str = "MAILSWEEP_GOOGLE_CLIENT_SECRET";
pub const MICROSOFT_CLIENT_SECRET_ENV: &str = "MAILSWEEP_MICROSOFT_CLIENT_SECRET";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("no config directory available on this platform")]
    NoConfigDir,

    #[error("missing secret: set {0} or store it in the keychain")]
    MissingSecret(&'static str),

    #[error("keychain error: {0}")]
    Keychain(#[from] KeychainError),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "mailsweep", "mailsweep")
}

impl Settings {
    /// Default settings file path.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("settings.json"))
    }

    /// Loads settings from `MAILSWEEP_CONFIG` or the default path.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => Self::default_path().ok_or(SettingsError::NoConfigDir)?,
        };
        if !path.exists() {
            info!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Loads settings from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Resolved database file path.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database.path {
            return Ok(path.clone());
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join("mailsweep.db"))
            .ok_or(SettingsError::NoConfigDir)
    }
}

/// Secrets resolved at startup.
#[derive(Clone)]
pub struct Secrets {
    /// Vault built from the configured key.
    pub vault: CredentialVault,
    /// Shared secret required by runner invocations.
    pub cron_secret: String,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("vault", &self.vault)
            .field("cron_secret", &"<redacted>")
            .finish()
    }
}

fn client_secret_env(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::Gmail => GOOGLE_CLIENT_SECRET_ENV,
        ProviderKind::Outlook => MICROSOFT_CLIENT_SECRET_ENV,
    }
}

/// Resolves the vault key, runner secret and OAuth client secrets.
///
/// `lookup` reads a variable from the environment; the keychain is consulted
/// only when `security.use_keychain` is set. Client secrets are written into
/// `settings.providers`.
pub async fn resolve_secrets<F>(
    settings: &mut Settings,
    keychain: &KeychainAccess,
    lookup: F,
) -> Result<Secrets>
where
    F: Fn(&str) -> Option<String>,
{
    let use_keychain = settings.security.use_keychain;

    for provider in ProviderKind::PREFERENCE {
        let provider_settings = settings.providers.get_mut(provider);
        if provider_settings.client_secret.is_some() {
            continue;
        }
        let mut secret = lookup(client_secret_env(provider));
        if secret.is_none() && use_keychain {
            secret = keychain
                .get(SecretSlot::OAuthClientSecret(provider))
                .await?;
        }
        provider_settings.client_secret = secret;
    }

    let mut vault_key = lookup(VAULT_KEY_ENV);
    if vault_key.is_none() && use_keychain {
        vault_key = if settings.security.create_vault_key {
            let fresh = CredentialVault::generate_key()
                .map_err(|_| SettingsError::MissingSecret(VAULT_KEY_ENV))?;
            Some(
                keychain
                    .get_or_create(SecretSlot::VaultKey, move || fresh)
                    .await?,
            )
        } else {
            keychain.get(SecretSlot::VaultKey).await?
        };
    }
    let vault_key = vault_key.ok_or(SettingsError::MissingSecret(VAULT_KEY_ENV))?;
    let vault = CredentialVault::from_base64(&vault_key)
        .map_err(|_| SettingsError::MissingSecret(VAULT_KEY_ENV))?;

    let mut cron_secret = lookup(CRON_SECRET_ENV);
    if cron_secret.is_none() && use_keychain {
        cron_secret = keychain.get(SecretSlot::CronSecret).await?;
    }
    let cron_secret = cron_secret
        .filter(|s| !s.is_empty())
        .ok_or(SettingsError::MissingSecret(CRON_SECRET_ENV))?;

    Ok(Secrets { vault, cron_secret })
}
