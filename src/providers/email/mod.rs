//! Mail provider implementations.
//!
//! This module contains the [`MailProvider`] trait and adapters for the
//! supported mailbox APIs:
//!
//! - [`GmailProvider`] - Gmail REST API v1
//! - [`OutlookProvider`] - Microsoft Graph v1.0
//!
//! # Architecture
//!
//! Each adapter is bound to one connection and handles:
//!
//! - Resolving an access token through the [`TokenManager`](crate::vault::TokenManager)
//! - Translating Gmail-style queries into the native syntax ([`query`])
//! - Normalizing responses into the shared domain types
//! - Discovering and executing unsubscribe actions ([`unsubscribe`])

mod cache;
mod factory;
mod gmail;
mod http;
mod outlook;
pub mod query;
mod traits;
pub mod unsubscribe;

pub use cache::RequestCache;
pub use factory::{HttpProviderFactory, ProviderFactory};
pub use gmail::{
    build_raw_message, gmail_flags_from_labels, gmail_label_for_flag, GmailProvider, GMAIL_API_BASE,
};
pub use outlook::{graph_flags, graph_patch_for_flag, OutlookProvider, GRAPH_API_BASE};
pub use traits::{Capabilities, Capability, MailProvider, ProviderError, Result, SearchPage};
