//! Gmail API provider implementation.
//!
//! This module provides a [`MailProvider`] implementation using the Gmail REST
//! API v1:
//! - `users.messages.list` / `users.messages.get` for search
//! - `users.messages.batchModify` for flags, labels, archive and trash
//! - `users.messages.send` and `users.drafts.create` for outgoing mail
//! - `users.labels` for label resolution and mailbox counters

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use lettre::Message;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::cache::RequestCache;
use super::http::{ApiClient, BearerToken};
use super::query::{parse_query, to_gmail_query};
use super::unsubscribe::{
    group_by_sender, parse_list_unsubscribe, unsubscribe_via_web, ScannedMessage,
};
use super::{Capabilities, Capability, MailProvider, ProviderError, Result, SearchPage};
use crate::domain::{
    Address, EmailConnection, LabelChange, MailboxStats, MessageFlag, MessageId,
    NormalizedMessage, OutgoingEmail, ProviderKind, ThreadId, UnsubscribeCandidate,
    UnsubscribeMethod,
};
use crate::vault::TokenManager;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Gmail caps `maxResults` and `batchModify` ids per request.
const LIST_PAGE_MAX: u32 = 500;
const BATCH_MODIFY_MAX: usize = 1000;
const FETCH_CONCURRENCY: usize = 10;

const METADATA_HEADERS: [&str; 6] = [
    "From",
    "To",
    "Subject",
    "Date",
    "List-Unsubscribe",
    "List-Unsubscribe-Post",
];

const UNSUBSCRIBE_SCAN_QUERY: &str = "unsubscribe newer_than:6m -in:sent -in:drafts";

const CAPABILITIES: Capabilities = Capabilities::new(&[
    Capability::Search,
    Capability::Send,
    Capability::Drafts,
    Capability::Flags,
    Capability::AddLabels,
    Capability::RemoveLabels,
    Capability::Archive,
    Capability::Trash,
    Capability::Unsubscribe,
    Capability::Stats,
]);

/// Gmail API message list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<GmailMessageRef>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageRef {
    id: String,
}

/// Gmail API message in `metadata` format.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: String,
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    payload: Option<GmailMessagePayload>,
    internal_date: Option<String>,
}

/// Gmail message payload (headers only in `metadata` format).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessagePayload {
    headers: Option<Vec<GmailHeader>>,
    mime_type: Option<String>,
}

/// Gmail message header.
#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

impl GmailMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.headers.as_ref())
            .and_then(|h| h.iter().find(|hdr| hdr.name.eq_ignore_ascii_case(name)))
            .map(|h| h.value.as_str())
    }

    fn date(&self) -> DateTime<Utc> {
        self.internal_date
            .as_ref()
            .and_then(|d| d.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now)
    }
}

/// Gmail API label.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabel {
    id: String,
    name: String,
    messages_total: Option<u64>,
    messages_unread: Option<u64>,
}

/// Gmail labels list response.
#[derive(Debug, Deserialize)]
struct LabelsListResponse {
    labels: Option<Vec<GmailLabel>>,
}

/// Gmail label creation request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLabelRequest<'a> {
    name: &'a str,
    label_list_visibility: &'static str,
    message_list_visibility: &'static str,
}

/// Gmail profile response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    messages_total: Option<u64>,
}

/// Gmail batch modify request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchModifyRequest<'a> {
    ids: &'a [&'a str],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    add_label_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    remove_label_ids: Vec<String>,
}

/// Gmail send request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct DraftRequest {
    message: RawMessage,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

/// Maps Gmail system labels onto normalized flags.
pub fn gmail_flags_from_labels(labels: &[String]) -> BTreeSet<MessageFlag> {
    labels
        .iter()
        .filter_map(|label| match label.as_str() {
            "UNREAD" => Some(MessageFlag::Unread),
            "DRAFT" => Some(MessageFlag::Draft),
            "IMPORTANT" => Some(MessageFlag::Important),
            "STARRED" => Some(MessageFlag::Starred),
            _ => None,
        })
        .collect()
}

/// Gmail system label for a flag. `Draft` cannot be toggled.
pub fn gmail_label_for_flag(flag: MessageFlag) -> Option<&'static str> {
    match flag {
        MessageFlag::Unread => Some("UNREAD"),
        MessageFlag::Important => Some("IMPORTANT"),
        MessageFlag::Starred => Some("STARRED"),
        MessageFlag::Draft => None,
    }
}

fn normalize(msg: GmailMessage) -> NormalizedMessage {
    let labels = msg.label_ids.clone().unwrap_or_default();
    let has_attachments = msg
        .payload
        .as_ref()
        .and_then(|p| p.mime_type.as_deref())
        .map(|m| m.eq_ignore_ascii_case("multipart/mixed"))
        .unwrap_or(false);

    NormalizedMessage {
        id: MessageId(msg.id.clone()),
        thread_id: ThreadId(msg.thread_id.clone()),
        from: msg
            .header("From")
            .map(Address::parse)
            .unwrap_or_else(|| Address::new("unknown@unknown.com")),
        to: msg.header("To").map(Address::parse_list).unwrap_or_default(),
        subject: msg.header("Subject").map(str::to_string),
        date: msg.date(),
        snippet: msg.snippet.clone().unwrap_or_default(),
        flags: gmail_flags_from_labels(&labels),
        has_attachments,
        native_labels: labels,
    }
}

fn mailbox(address: &Address) -> Result<Mailbox> {
    let email = address
        .email
        .parse::<lettre::Address>()
        .map_err(|e| {
            ProviderError::InvalidRequest(format!("invalid address {}: {e}", address.email))
        })?;
    Ok(Mailbox::new(address.name.clone(), email))
}

/// Builds an RFC 5322 message and encodes it as Gmail's `raw` field.
pub fn build_raw_message(email: &OutgoingEmail, from: &Address) -> Result<String> {
    let mut builder = Message::builder()
        .from(mailbox(from)?)
        .subject(email.subject.clone())
        .keep_bcc();

    for addr in &email.to {
        builder = builder.to(mailbox(addr)?);
    }
    for addr in &email.cc {
        builder = builder.cc(mailbox(addr)?);
    }
    for addr in &email.bcc {
        builder = builder.bcc(mailbox(addr)?);
    }
    if let Some(in_reply_to) = &email.in_reply_to_message {
        builder = builder
            .in_reply_to(in_reply_to.clone())
            .references(in_reply_to.clone());
    }

    let message = match &email.body_html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            email.body_text.clone(),
            html.clone(),
        )),
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(email.body_text.clone()),
    }
    .map_err(|e| ProviderError::InvalidRequest(format!("build message: {e}")))?;

    Ok(BASE64_URL_SAFE_NO_PAD.encode(message.formatted()))
}

/// Gmail API provider.
///
/// Bound to one connection; the access token is resolved once per adapter
/// through the [`TokenManager`].
pub struct GmailProvider {
    api: ApiClient,
    token: BearerToken,
    unsubscribe_scan: u32,
}

impl GmailProvider {
    /// Creates a new Gmail provider for the given connection.
    pub fn new(
        connection: EmailConnection,
        tokens: Arc<TokenManager>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            api: ApiClient::new(http, GMAIL_API_BASE),
            token: BearerToken::new(connection, tokens),
            unsubscribe_scan: 200,
        }
    }

    /// Points the provider at a different API root.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.api = ApiClient::new(self.api.http().clone(), base);
        self
    }

    /// Number of recent messages scanned for unsubscribe headers.
    pub fn with_unsubscribe_scan(mut self, scan: u32) -> Self {
        self.unsubscribe_scan = scan.max(1);
        self
    }

    fn connection(&self) -> &EmailConnection {
        self.token.connection()
    }

    async fn token(&self) -> Result<&str> {
        self.token.get().await
    }

    async fn list_ids(&self, q: &str, max: u32) -> Result<Vec<String>> {
        let token = self.token().await?;
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while (ids.len() as u32) < max {
            let remaining = (max - ids.len() as u32).min(LIST_PAGE_MAX);
            let mut query = vec![("maxResults", remaining.to_string())];
            if !q.is_empty() {
                query.push(("q", q.to_string()));
            }
            if let Some(page) = &page_token {
                query.push(("pageToken", page.clone()));
            }

            let response: MessageListResponse = self.api.get(token, "/messages", &query).await?;
            ids.extend(response.messages.unwrap_or_default().into_iter().map(|m| m.id));

            match response.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        ids.truncate(max as usize);
        Ok(ids)
    }

    /// Fetches message metadata, preserving the order of `ids`.
    async fn fetch_metadata(&self, ids: Vec<String>) -> Result<Vec<GmailMessage>> {
        let token = self.token().await?.to_string();
        let mut fetched: Vec<(usize, GmailMessage)> = Vec::with_capacity(ids.len());

        let indexed: Vec<(usize, String)> = ids.into_iter().enumerate().collect();
        for chunk in indexed.chunks(FETCH_CONCURRENCY) {
            let mut set = JoinSet::new();
            for (index, id) in chunk.iter().cloned() {
                let api = self.api.clone();
                let token = token.clone();
                set.spawn(async move {
                    let mut query = vec![("format", "metadata".to_string())];
                    query.extend(
                        METADATA_HEADERS
                            .iter()
                            .map(|h| ("metadataHeaders", h.to_string())),
                    );
                    let result: Result<GmailMessage> =
                        api.get(&token, &format!("/messages/{id}"), &query).await;
                    (index, result)
                });
            }
            while let Some(joined) = set.join_next().await {
                let (index, result) =
                    joined.map_err(|e| ProviderError::Internal(format!("fetch task failed: {e}")))?;
                match result {
                    Ok(message) => fetched.push((index, message)),
                    // Deleted between list and get.
                    Err(ProviderError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        fetched.sort_by_key(|(index, _)| *index);
        Ok(fetched.into_iter().map(|(_, m)| m).collect())
    }

    async fn batch_modify(
        &self,
        ids: &[MessageId],
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<usize> {
        if ids.is_empty() || (add.is_empty() && remove.is_empty()) {
            return Ok(0);
        }
        let token = self.token().await?;
        let ids: Vec<&str> = ids.iter().map(MessageId::as_str).collect();

        for chunk in ids.chunks(BATCH_MODIFY_MAX) {
            let body = BatchModifyRequest {
                ids: chunk,
                add_label_ids: add.clone(),
                remove_label_ids: remove.clone(),
            };
            self.api
                .execute(Method::POST, token, "/messages/batchModify", Some(&body))
                .await?;
        }
        Ok(ids.len())
    }

    async fn load_labels(&self, cache: &RequestCache) -> Result<()> {
        let token = self.token().await?;
        let response: LabelsListResponse = self.api.get(token, "/labels", &[]).await?;
        for label in response.labels.unwrap_or_default() {
            cache.remember_label(
                &self.connection().user_id,
                ProviderKind::Gmail,
                &label.name,
                &label.id,
            );
        }
        Ok(())
    }

    /// Resolves label names to ids, creating missing labels when `create` is set.
    async fn resolve_labels(
        &self,
        names: &[String],
        create: bool,
        cache: &RequestCache,
    ) -> Result<Vec<String>> {
        let user_id = &self.connection().user_id;
        let mut loaded = false;
        let mut ids = Vec::with_capacity(names.len());

        for name in names {
            if let Some(id) = cache.label_id(user_id, ProviderKind::Gmail, name) {
                ids.push(id);
                continue;
            }
            if !loaded {
                self.load_labels(cache).await?;
                loaded = true;
                if let Some(id) = cache.label_id(user_id, ProviderKind::Gmail, name) {
                    ids.push(id);
                    continue;
                }
            }
            if !create {
                debug!(label = %name, "Label does not exist, nothing to remove");
                continue;
            }

            let token = self.token().await?;
            let request = CreateLabelRequest {
                name,
                label_list_visibility: "labelShow",
                message_list_visibility: "show",
            };
            let created: IdResponse = self.api.post(token, "/labels", &request).await?;
            info!(user_id = %user_id, label = %name, "Created Gmail label");
            cache.remember_label(user_id, ProviderKind::Gmail, name, &created.id);
            ids.push(created.id);
        }
        Ok(ids)
    }

    fn raw_message(&self, email: &OutgoingEmail) -> Result<RawMessage> {
        let from = Address::new(self.connection().account_email.clone());
        Ok(RawMessage {
            raw: build_raw_message(email, &from)?,
            thread_id: email.in_reply_to_thread.as_ref().map(|t| t.0.clone()),
        })
    }

    async fn label_counts(&self, label: &str) -> Result<GmailLabel> {
        let token = self.token().await?;
        self.api.get(token, &format!("/labels/{label}"), &[]).await
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    async fn search(&self, query: &str, max: u32) -> Result<SearchPage> {
        let native_query = to_gmail_query(&parse_query(query));
        let ids = self.list_ids(&native_query, max).await?;
        let messages = self.fetch_metadata(ids).await?;

        Ok(SearchPage {
            messages: messages.into_iter().map(normalize).collect(),
            native_query,
            unsupported: Vec::new(),
        })
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<String> {
        let token = self.token().await?;
        let body = self.raw_message(email)?;
        let sent: IdResponse = self.api.post(token, "/messages/send", &body).await?;
        info!(user_id = %self.connection().user_id, message_id = %sent.id, "Sent Gmail message");
        Ok(sent.id)
    }

    async fn create_draft(&self, email: &OutgoingEmail) -> Result<String> {
        let token = self.token().await?;
        let body = DraftRequest {
            message: self.raw_message(email)?,
        };
        let draft: IdResponse = self.api.post(token, "/drafts", &body).await?;
        Ok(draft.id)
    }

    async fn modify_flags(
        &self,
        ids: &[MessageId],
        add: &[MessageFlag],
        remove: &[MessageFlag],
    ) -> Result<usize> {
        let to_labels = |flags: &[MessageFlag]| -> Vec<String> {
            flags
                .iter()
                .filter_map(|f| gmail_label_for_flag(*f))
                .map(str::to_string)
                .collect()
        };
        self.batch_modify(ids, to_labels(add), to_labels(remove)).await
    }

    async fn apply_labels(
        &self,
        ids: &[MessageId],
        add: &[String],
        remove: &[String],
        cache: &RequestCache,
    ) -> Result<LabelChange> {
        let add_ids = self.resolve_labels(add, true, cache).await?;
        let remove_ids = self.resolve_labels(remove, false, cache).await?;
        let messages = self.batch_modify(ids, add_ids, remove_ids).await?;

        Ok(LabelChange {
            messages,
            added: add.to_vec(),
            removed: remove.to_vec(),
        })
    }

    async fn archive(&self, ids: &[MessageId]) -> Result<usize> {
        self.batch_modify(ids, Vec::new(), vec!["INBOX".to_string()])
            .await
    }

    async fn trash(&self, ids: &[MessageId]) -> Result<usize> {
        self.batch_modify(ids, vec!["TRASH".to_string()], vec!["INBOX".to_string()])
            .await
    }

    async fn find_unsubscribable(&self, max: u32) -> Result<Vec<UnsubscribeCandidate>> {
        let ids = self.list_ids(UNSUBSCRIBE_SCAN_QUERY, self.unsubscribe_scan).await?;
        let messages = self.fetch_metadata(ids).await?;

        let scanned = messages.into_iter().filter_map(|msg| {
            let header = msg.header("List-Unsubscribe")?;
            let methods = parse_list_unsubscribe(header, msg.header("List-Unsubscribe-Post"));
            Some(ScannedMessage {
                sender: Address::parse(msg.header("From")?),
                message_id: MessageId(msg.id.clone()),
                date: msg.date(),
                methods,
            })
        });
        Ok(group_by_sender(scanned, max as usize))
    }

    async fn unsubscribe(&self, candidate: &UnsubscribeCandidate) -> Result<()> {
        let mut last_error = None;

        for method in &candidate.methods {
            let attempt = match method {
                UnsubscribeMethod::Mailto {
                    address,
                    subject,
                    body,
                } => {
                    let email = OutgoingEmail::new(
                        vec![Address::new(address.clone())],
                        subject.clone().unwrap_or_else(|| "unsubscribe".to_string()),
                        body.clone().unwrap_or_else(|| "unsubscribe".to_string()),
                    );
                    self.send(&email).await.map(|_| true)
                }
                other => unsubscribe_via_web(self.api.http(), other).await,
            };
            match attempt {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        sender = %candidate.sender.email,
                        error = %e,
                        "Unsubscribe method failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::InvalidRequest(format!(
                "no usable unsubscribe method for {}",
                candidate.sender.email
            ))
        }))
    }

    async fn stats(&self) -> Result<MailboxStats> {
        let token = self.token().await?;
        let profile: ProfileResponse = self.api.get(token, "/profile", &[]).await?;
        let inbox = self.label_counts("INBOX").await?;
        let unread = self.label_counts("UNREAD").await?;

        Ok(MailboxStats {
            total_messages: profile.messages_total.unwrap_or(0),
            unread_messages: unread.messages_total.unwrap_or(0),
            inbox_total: inbox.messages_total.unwrap_or(0),
            inbox_unread: inbox.messages_unread.unwrap_or(0),
        })
    }
}
