//! External mailbox provider integrations.
//!
//! - [`email`] - Mail providers (Gmail API, Microsoft Graph)

pub mod email;
