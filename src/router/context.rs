//! Who a router call is made on behalf of.

use std::sync::Arc;

use crate::domain::UserId;
use crate::providers::email::RequestCache;

use super::RouterError;

/// Privilege scope of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallScope {
    /// A signed-in user acting on their own mailbox.
    Interactive { session_user: UserId },
    /// The cron runner acting for any user.
    Background,
}

/// Scope plus the process-wide lookup cache.
#[derive(Debug, Clone)]
pub struct CallContext {
    scope: CallScope,
    cache: Arc<RequestCache>,
}

impl CallContext {
    pub fn interactive(session_user: UserId, cache: Arc<RequestCache>) -> Self {
        Self {
            scope: CallScope::Interactive { session_user },
            cache,
        }
    }

    pub fn background(cache: Arc<RequestCache>) -> Self {
        Self {
            scope: CallScope::Background,
            cache,
        }
    }

    pub fn scope(&self) -> &CallScope {
        &self.scope
    }

    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    /// Interactive calls may only target the session user.
    pub fn authorize(&self, user_id: &UserId) -> Result<(), RouterError> {
        match &self.scope {
            CallScope::Interactive { session_user } if session_user != user_id => {
                Err(RouterError::Forbidden {
                    requested: user_id.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}
