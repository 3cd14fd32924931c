//! OS keychain slots for process secrets.
//!
//! The vault key, the runner's shared secret and the OAuth client secrets
//! can live in the platform credential store instead of the environment.
//! Each secret has a fixed [`SecretSlot`] inside one service namespace.

use std::fmt;

use thiserror::Error;

use crate::domain::ProviderKind;

#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("keychain error for {slot}: {source}")]
    Keyring {
        slot: SecretSlot,
        #[source]
        source: keyring::Error,
    },

    #[error("keychain task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, KeychainError>;

/// A named secret in the keychain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSlot {
    /// Base64 AES-256 key sealing stored OAuth tokens.
    VaultKey,
    /// Shared secret the runner checks before processing queues.
    CronSecret,
    OAuthClientSecret(ProviderKind),
}

impl SecretSlot {
    /// Account name the slot is stored under.
    pub fn account(self) -> String {
        match self {
            Self::VaultKey => "vault.key".to_string(),
            Self::CronSecret => "runner.cron_secret".to_string(),
            Self::OAuthClientSecret(provider) => format!("oauth.client_secret.{provider}"),
        }
    }
}

impl fmt::Display for SecretSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.account())
    }
}

/// Handle on one keychain service namespace.
#[derive(Debug, Clone)]
pub struct KeychainAccess {
    service: String,
}

impl KeychainAccess {
    pub const DEFAULT_SERVICE: &'static str = "io.mailsweep.core";

    pub fn new() -> Self {
        Self::with_service(Self::DEFAULT_SERVICE)
    }

    /// Uses a separate namespace, e.g. so tests never touch real secrets.
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Runs `op` against the slot's keyring entry on the blocking pool.
    async fn on_entry<T, F>(&self, slot: SecretSlot, op: F) -> Result<T>
    where
        F: FnOnce(&keyring::Entry) -> keyring::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || {
            keyring::Entry::new(&service, &slot.account())
                .and_then(|entry| op(&entry))
                .map_err(|source| KeychainError::Keyring { slot, source })
        })
        .await
        .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
    }

    /// Reads a slot; a missing entry is `None`.
    pub async fn get(&self, slot: SecretSlot) -> Result<Option<String>> {
        self.on_entry(slot, |entry| match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    /// Writes a slot, replacing any previous value.
    pub async fn set(&self, slot: SecretSlot, secret: &str) -> Result<()> {
        let secret = secret.to_string();
        self.on_entry(slot, move |entry| entry.set_password(&secret))
            .await
    }

    /// Clears a slot. Returns whether anything was stored.
    pub async fn remove(&self, slot: SecretSlot) -> Result<bool> {
        self.on_entry(slot, |entry| match entry.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    /// Returns the stored secret, storing `create()` first if the slot is empty.
    pub async fn get_or_create<F>(&self, slot: SecretSlot, create: F) -> Result<String>
    where
        F: FnOnce() -> String,
    {
        if let Some(existing) = self.get(slot).await? {
            return Ok(existing);
        }
        let secret = create();
        self.set(slot, &secret).await?;
        tracing::info!(slot = %slot, service = %self.service, "Stored new secret in keychain");
        Ok(secret)
    }
}

impl Default for KeychainAccess {
    fn default() -> Self {
        Self::new()
    }
}
