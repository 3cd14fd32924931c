//! Process-scoped lookup cache shared by adapters.
//!
//! Holds label name to provider label id mappings per (user, provider). The
//! cache lives for the lifetime of the process and is never persisted.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::domain::{ProviderKind, UserId};

const DEFAULT_CAPACITY: usize = 1024;

type LabelKey = (UserId, ProviderKind, String);

/// Bounded LRU cache of label ids.
#[derive(Debug)]
pub struct RequestCache {
    labels: Mutex<LruCache<LabelKey, String>>,
}

impl RequestCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            labels: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(user_id: &UserId, provider: ProviderKind, name: &str) -> LabelKey {
        (user_id.clone(), provider, name.to_lowercase())
    }

    /// Cached provider id for a label name. Names compare case-insensitively.
    pub fn label_id(&self, user_id: &UserId, provider: ProviderKind, name: &str) -> Option<String> {
        let mut labels = self.labels.lock().unwrap_or_else(|e| e.into_inner());
        labels.get(&Self::key(user_id, provider, name)).cloned()
    }

    pub fn remember_label(&self, user_id: &UserId, provider: ProviderKind, name: &str, id: &str) {
        let mut labels = self.labels.lock().unwrap_or_else(|e| e.into_inner());
        labels.put(Self::key(user_id, provider, name), id.to_string());
    }

    /// Drops every entry for one user and provider, e.g. after a disconnect.
    pub fn forget(&self, user_id: &UserId, provider: ProviderKind) {
        let mut labels = self.labels.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<LabelKey> = labels
            .iter()
            .filter(|((user, kind, _), _)| user == user_id && *kind == provider)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            labels.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.labels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
