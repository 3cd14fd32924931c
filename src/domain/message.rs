//! Provider-independent message types.
//!
//! Every adapter normalizes its native responses into these shapes so that
//! the router, executor and runner never see provider-specific payloads.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, ThreadId};

/// A mailbox address as it appears in From/To headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub email: String,
    pub name: Option<String>,
}

impl Address {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Parses a header value like `"Name" <email@example.com>`.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
            if start < end {
                let email = value[start + 1..end].trim().to_string();
                let name = value[..start].trim().trim_matches('"').trim().to_string();
                let name = (!name.is_empty()).then_some(name);
                return Address { email, name };
            }
        }
        Address::new(value)
    }

    /// Parses a comma-separated address list, skipping empty entries.
    pub fn parse_list(value: &str) -> Vec<Self> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Returns whether the address has the shape `local@domain.tld`.
    pub fn is_valid(&self) -> bool {
        let mut parts = self.email.split('@');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) => {
                !local.is_empty()
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !self.email.chars().any(char::is_whitespace)
            }
            _ => false,
        }
    }

    /// Returns the lowercase domain part, if any.
    pub fn domain(&self) -> Option<String> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
    }

}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} <{}>", self.email),
            None => f.write_str(&self.email),
        }
    }
}

/// Closed, provider-independent flag vocabulary.
///
/// Adapters map provider-native labels and properties onto these in both
/// directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFlag {
    Unread,
    Draft,
    Important,
    Starred,
}

/// Provider-independent view of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub from: Address,
    pub to: Vec<Address>,
    pub subject: Option<String>,
    pub date: DateTime<Utc>,
    pub snippet: String,
    pub flags: BTreeSet<MessageFlag>,
    pub has_attachments: bool,
    /// Provider-native label ids (Gmail) or folder id (Outlook), informational only.
    #[serde(default)]
    pub native_labels: Vec<String>,
}

impl NormalizedMessage {
    /// Returns whether the message carries the given flag.
    pub fn has_flag(&self, flag: MessageFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// An email to be sent or saved as a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    /// Recipient addresses.
    pub to: Vec<Address>,
    /// CC addresses.
    #[serde(default)]
    pub cc: Vec<Address>,
    /// BCC addresses.
    #[serde(default)]
    pub bcc: Vec<Address>,
    /// Email subject.
    pub subject: String,
    /// Plain text body.
    pub body_text: String,
    /// HTML body (optional).
    #[serde(default)]
    pub body_html: Option<String>,
    /// Thread ID if this is a reply.
    #[serde(default)]
    pub in_reply_to_thread: Option<ThreadId>,
    /// Message-ID header of the email being replied to.
    #[serde(default)]
    pub in_reply_to_message: Option<String>,
}

impl OutgoingEmail {
    /// Creates a plain-text email to the given recipients.
    pub fn new(to: Vec<Address>, subject: impl Into<String>, body_text: impl Into<String>) -> Self {
        Self {
            to,
            cc: vec![],
            bcc: vec![],
            subject: subject.into(),
            body_text: body_text.into(),
            body_html: None,
            in_reply_to_thread: None,
            in_reply_to_message: None,
        }
    }
}

/// Mailbox counters reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStats {
    pub total_messages: u64,
    pub unread_messages: u64,
    pub inbox_total: u64,
    pub inbox_unread: u64,
}

/// One way of unsubscribing from a mailing list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum UnsubscribeMethod {
    /// RFC 8058 one-click POST.
    OneClick { url: String },
    /// Plain HTTPS link that unsubscribes on GET.
    Http { url: String },
    /// Send an email to the list's unsubscribe address.
    Mailto {
        address: String,
        subject: Option<String>,
        body: Option<String>,
    },
    /// Provider-native unsubscribe action on the message itself.
    Native,
}

/// A sender the user can unsubscribe from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeCandidate {
    /// The list's sender.
    pub sender: Address,
    /// Most recent message carrying the unsubscribe information.
    pub message_id: MessageId,
    /// Number of scanned messages from this sender.
    pub message_count: u32,
    /// Available methods, best first.
    pub methods: Vec<UnsubscribeMethod>,
}

/// Per-sender unsubscribe failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeFailure {
    pub sender: String,
    pub reason: String,
}

/// Outcome of a bulk unsubscribe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeReport {
    pub attempted: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<UnsubscribeFailure>,
}

/// Outcome of a label change over a set of messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelChange {
    pub messages: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}
