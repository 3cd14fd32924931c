//! mailsweep - Runs the recurring task and scheduled email queues

use std::sync::Arc;

use anyhow::Context;
use mailsweep::config::{resolve_secrets, Settings};
use mailsweep::domain::ProviderKind;
use mailsweep::providers::email::{HttpProviderFactory, RequestCache};
use mailsweep::storage::{KeychainAccess, StorageLayer};
use mailsweep::vault::{OAuth2Client, TokenManager};
use mailsweep::{CronRunner, ProviderRouter, TaskExecutor};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting mailsweep");

    let mut settings = Settings::load().context("loading settings")?;
    let keychain = KeychainAccess::with_service(settings.security.keychain_service.clone());
    let secrets = resolve_secrets(&mut settings, &keychain, |name| std::env::var(name).ok())
        .await
        .context("resolving secrets")?;

    let db_path = settings.database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let storage = StorageLayer::new(&db_path)
        .await
        .with_context(|| format!("opening {}", db_path.display()))?;
    let store = storage.store();

    for provider in ProviderKind::PREFERENCE {
        if !settings.providers.get(provider).is_configured() {
            tracing::warn!(provider = %provider, "OAuth client not configured");
        }
    }
    let oauth = Arc::new(OAuth2Client::new(settings.providers.clone()));
    let tokens = Arc::new(TokenManager::new(secrets.vault.clone(), oauth, store.clone()));
    let factory = Arc::new(HttpProviderFactory::new(tokens, &settings.executor));
    let cache = Arc::new(RequestCache::default());
    let router = Arc::new(ProviderRouter::new(store.clone(), factory));
    let executor = Arc::new(TaskExecutor::new(
        router.clone(),
        cache.clone(),
        settings.executor.clone(),
    ));
    let runner = Arc::new(CronRunner::new(
        store.clone(),
        store,
        executor,
        router,
        cache,
        &secrets.cron_secret,
        settings.runner.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    runner.run_forever(secrets.cron_secret, shutdown_rx).await;
    Ok(())
}
