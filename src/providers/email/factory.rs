//! Builds the adapter for a connection.

use std::sync::Arc;

use super::{GmailProvider, MailProvider, OutlookProvider};
use crate::config::ExecutorSettings;
use crate::domain::{EmailConnection, ProviderKind};
use crate::vault::TokenManager;

/// Creates the [`MailProvider`] for a connection.
///
/// This is the only place that branches on [`ProviderKind`].
pub trait ProviderFactory: Send + Sync {
    fn build(&self, connection: EmailConnection) -> Box<dyn MailProvider>;
}

/// Factory for the real Gmail and Microsoft Graph adapters.
#[derive(Debug, Clone)]
pub struct HttpProviderFactory {
    tokens: Arc<TokenManager>,
    http: reqwest::Client,
    unsubscribe_scan: u32,
}

impl HttpProviderFactory {
    pub fn new(tokens: Arc<TokenManager>, settings: &ExecutorSettings) -> Self {
        Self {
            tokens,
            http: reqwest::Client::new(),
            unsubscribe_scan: settings.unsubscribe_scan_size,
        }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn build(&self, connection: EmailConnection) -> Box<dyn MailProvider> {
        match connection.provider {
            ProviderKind::Gmail => Box::new(
                GmailProvider::new(connection, self.tokens.clone(), self.http.clone())
                    .with_unsubscribe_scan(self.unsubscribe_scan),
            ),
            ProviderKind::Outlook => Box::new(
                OutlookProvider::new(connection, self.tokens.clone(), self.http.clone())
                    .with_unsubscribe_scan(self.unsubscribe_scan),
            ),
        }
    }
}
