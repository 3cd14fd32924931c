//! Microsoft Graph mail provider implementation.
//!
//! Outlook has folders instead of labels: adding a label moves the message
//! into the folder of that name, and removing one has no equivalent.
//! Archive and trash are moves into the `archive` and `deleteditems`
//! well-known folders. Moving a message gives it a new id, so a 404 on move
//! means it was already moved and counts as success.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::cache::RequestCache;
use super::http::{ApiClient, BearerToken};
use super::query::{parse_query, to_graph_filter, well_known_folder, GraphFolder};
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

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Graph caps `$top` for messages.
const PAGE_MAX: u32 = 1000;

const MESSAGE_SELECT: &str = "id,conversationId,from,toRecipients,subject,receivedDateTime,\
bodyPreview,isRead,isDraft,importance,flag,hasAttachments,parentFolderId";

const UNSUBSCRIBE_SELECT: &str = "id,from,receivedDateTime,unsubscribeEnabled,unsubscribeData";

const CAPABILITIES: Capabilities = Capabilities::new(&[
    Capability::Search,
    Capability::Send,
    Capability::Drafts,
    Capability::Flags,
    Capability::AddLabels,
    Capability::Archive,
    Capability::Trash,
    Capability::Unsubscribe,
    Capability::Stats,
]);

/// Graph collection response.
#[derive(Debug, Deserialize)]
struct Collection<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GraphEmailAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphEmailAddress,
}

impl GraphRecipient {
    fn to_address(&self) -> Option<Address> {
        let email = self.email_address.address.clone()?;
        Some(Address {
            email,
            name: self.email_address.name.clone().filter(|n| !n.is_empty()),
        })
    }

    fn from_address(address: &Address) -> Self {
        Self {
            email_address: GraphEmailAddress {
                name: address.name.clone(),
                address: Some(address.email.clone()),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFlag {
    flag_status: Option<String>,
}

/// Graph message resource (selected properties).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    conversation_id: Option<String>,
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    subject: Option<String>,
    received_date_time: Option<DateTime<Utc>>,
    body_preview: Option<String>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    is_draft: bool,
    importance: Option<String>,
    flag: Option<GraphFlag>,
    #[serde(default)]
    has_attachments: bool,
    parent_folder_id: Option<String>,
    #[serde(default)]
    unsubscribe_enabled: bool,
    #[serde(default)]
    unsubscribe_data: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolderResource {
    id: String,
    #[serde(default)]
    total_item_count: u64,
    #[serde(default)]
    unread_item_count: u64,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

/// Outgoing message body in Graph's shape.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphOutgoing {
    subject: String,
    body: GraphBody,
    to_recipients: Vec<GraphRecipient>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cc_recipients: Vec<GraphRecipient>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc_recipients: Vec<GraphRecipient>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: &'static str,
    content: String,
}

impl GraphOutgoing {
    fn from_email(email: &OutgoingEmail) -> Self {
        let body = match &email.body_html {
            Some(html) => GraphBody {
                content_type: "HTML",
                content: html.clone(),
            },
            None => GraphBody {
                content_type: "Text",
                content: email.body_text.clone(),
            },
        };
        Self {
            subject: email.subject.clone(),
            body,
            to_recipients: email.to.iter().map(GraphRecipient::from_address).collect(),
            cc_recipients: email.cc.iter().map(GraphRecipient::from_address).collect(),
            bcc_recipients: email.bcc.iter().map(GraphRecipient::from_address).collect(),
        }
    }
}

/// Maps Graph message properties onto normalized flags.
pub fn graph_flags(
    is_read: bool,
    is_draft: bool,
    importance: Option<&str>,
    flag_status: Option<&str>,
) -> BTreeSet<MessageFlag> {
    let mut flags = BTreeSet::new();
    if !is_read {
        flags.insert(MessageFlag::Unread);
    }
    if is_draft {
        flags.insert(MessageFlag::Draft);
    }
    if importance.is_some_and(|i| i.eq_ignore_ascii_case("high")) {
        flags.insert(MessageFlag::Important);
    }
    if flag_status.is_some_and(|s| s.eq_ignore_ascii_case("flagged")) {
        flags.insert(MessageFlag::Starred);
    }
    flags
}

/// PATCH body that sets or clears a flag. `Draft` cannot be toggled.
pub fn graph_patch_for_flag(flag: MessageFlag, set: bool) -> Option<Value> {
    let patch = match flag {
        MessageFlag::Unread => json!({ "isRead": !set }),
        MessageFlag::Starred => json!({
            "flag": { "flagStatus": if set { "flagged" } else { "notFlagged" } }
        }),
        MessageFlag::Important => json!({ "importance": if set { "high" } else { "normal" } }),
        MessageFlag::Draft => return None,
    };
    Some(patch)
}

fn normalize(msg: GraphMessage) -> NormalizedMessage {
    let flags = graph_flags(
        msg.is_read,
        msg.is_draft,
        msg.importance.as_deref(),
        msg.flag.as_ref().and_then(|f| f.flag_status.as_deref()),
    );
    NormalizedMessage {
        thread_id: ThreadId(msg.conversation_id.clone().unwrap_or_else(|| msg.id.clone())),
        id: MessageId(msg.id),
        from: msg
            .from
            .as_ref()
            .and_then(GraphRecipient::to_address)
            .unwrap_or_else(|| Address::new("unknown@unknown.com")),
        to: msg.to_recipients.iter().filter_map(GraphRecipient::to_address).collect(),
        subject: msg.subject,
        date: msg.received_date_time.unwrap_or_else(Utc::now),
        snippet: msg.body_preview.unwrap_or_default(),
        flags,
        has_attachments: msg.has_attachments,
        native_labels: msg.parent_folder_id.into_iter().collect(),
    }
}

/// Unsubscribe methods advertised by a Graph message, best first.
fn unsubscribe_methods(msg: &GraphMessage) -> Vec<UnsubscribeMethod> {
    let parsed = parse_list_unsubscribe(&msg.unsubscribe_data.join(", "), None);
    let (mut methods, mailto): (Vec<_>, Vec<_>) = parsed
        .into_iter()
        .partition(|m| !matches!(m, UnsubscribeMethod::Mailto { .. }));
    if msg.unsubscribe_enabled {
        methods.push(UnsubscribeMethod::Native);
    }
    methods.extend(mailto);
    methods
}

fn odata_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Microsoft Graph mail provider.
pub struct OutlookProvider {
    api: ApiClient,
    token: BearerToken,
    unsubscribe_scan: u32,
}

impl OutlookProvider {
    /// Creates a new Outlook provider for the given connection.
    pub fn new(
        connection: EmailConnection,
        tokens: Arc<TokenManager>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            api: ApiClient::new(http, GRAPH_API_BASE),
            token: BearerToken::new(connection, tokens),
            unsubscribe_scan: 200,
        }
    }

    /// Points the provider at a different API root.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.api = ApiClient::new(self.api.http().clone(), base);
        self
    }

    /// Number of recent inbox messages scanned for unsubscribe data.
    pub fn with_unsubscribe_scan(mut self, scan: u32) -> Self {
        self.unsubscribe_scan = scan.max(1);
        self
    }

    fn connection(&self) -> &EmailConnection {
        self.token.connection()
    }

    fn messages_endpoint(folder_id: Option<&str>) -> String {
        match folder_id {
            Some(id) => format!("/me/mailFolders/{id}/messages"),
            None => "/me/messages".to_string(),
        }
    }

    /// Pages through a message collection until `max` items are collected.
    async fn collect_messages(
        &self,
        endpoint: &str,
        mut query: Vec<(&str, String)>,
        max: u32,
    ) -> Result<Vec<GraphMessage>> {
        let token = self.token.get().await?;
        query.push(("$top", max.min(PAGE_MAX).to_string()));

        let mut messages = Vec::new();
        let mut page: Collection<GraphMessage> = self.api.get(token, endpoint, &query).await?;
        loop {
            messages.extend(page.value);
            if messages.len() as u32 >= max {
                break;
            }
            match page.next_link {
                Some(next) => page = self.api.get(token, &next, &[]).await?,
                None => break,
            }
        }
        messages.truncate(max as usize);
        Ok(messages)
    }

    /// Finds a user folder by display name, creating it when `create` is set.
    async fn folder_id(
        &self,
        folder: &GraphFolder,
        create: bool,
        cache: Option<&RequestCache>,
    ) -> Result<Option<String>> {
        let name = match folder {
            GraphFolder::WellKnown(name) => return Ok(Some((*name).to_string())),
            GraphFolder::Named(name) => name,
        };
        let user_id = &self.connection().user_id;
        if let Some(id) = cache.and_then(|c| c.label_id(user_id, ProviderKind::Outlook, name)) {
            return Ok(Some(id));
        }

        let token = self.token.get().await?;
        let found: Collection<GraphFolderResource> = self
            .api
            .get(
                token,
                "/me/mailFolders",
                &[("$filter", format!("displayName eq {}", odata_string(name)))],
            )
            .await?;
        if let Some(folder) = found.value.into_iter().next() {
            if let Some(cache) = cache {
                cache.remember_label(user_id, ProviderKind::Outlook, name, &folder.id);
            }
            return Ok(Some(folder.id));
        }
        if !create {
            return Ok(None);
        }

        let created: IdResponse = self
            .api
            .post(token, "/me/mailFolders", &json!({ "displayName": name }))
            .await?;
        info!(user_id = %user_id, folder = %name, "Created Outlook folder");
        if let Some(cache) = cache {
            cache.remember_label(user_id, ProviderKind::Outlook, name, &created.id);
        }
        Ok(Some(created.id))
    }

    /// Moves messages into a folder and returns how many moved. A 404 means
    /// the message already left its folder; it is skipped, not an error.
    async fn move_to(&self, ids: &[MessageId], destination: &str) -> Result<usize> {
        let token = self.token.get().await?;
        let body = json!({ "destinationId": destination });
        let mut moved = 0;
        let mut gone = Vec::new();
        for id in ids {
            let endpoint = format!("/me/messages/{}/move", id.as_str());
            match self.api.execute(Method::POST, token, &endpoint, Some(&body)).await {
                Ok(()) => moved += 1,
                Err(ProviderError::NotFound(_)) => gone.push(id.as_str()),
                Err(e) => return Err(e),
            }
        }
        if !gone.is_empty() {
            debug!(destination, missing = ?gone, "Messages already moved");
        }
        Ok(moved)
    }

    /// Creates a draft, as a reply in the thread when one is given.
    async fn draft(&self, email: &OutgoingEmail) -> Result<String> {
        let token = self.token.get().await?;
        let outgoing = GraphOutgoing::from_email(email);

        let reply_to = match &email.in_reply_to_thread {
            Some(thread) => self.latest_in_conversation(thread).await?,
            None => None,
        };

        match reply_to {
            Some(message_id) => {
                let endpoint = format!("/me/messages/{message_id}/createReply");
                let reply: IdResponse = self.api.post(token, &endpoint, &json!({})).await?;
                self.api
                    .execute(
                        Method::PATCH,
                        token,
                        &format!("/me/messages/{}", reply.id),
                        Some(&outgoing),
                    )
                    .await?;
                Ok(reply.id)
            }
            None => {
                let created: IdResponse = self.api.post(token, "/me/messages", &outgoing).await?;
                Ok(created.id)
            }
        }
    }

    async fn latest_in_conversation(&self, thread: &ThreadId) -> Result<Option<String>> {
        let token = self.token.get().await?;
        let found: Collection<IdResponse> = self
            .api
            .get(
                token,
                "/me/messages",
                &[
                    ("$filter", format!("conversationId eq {}", odata_string(thread.as_str()))),
                    ("$select", "id".to_string()),
                    ("$top", "1".to_string()),
                ],
            )
            .await?;
        if found.value.is_empty() {
            warn!(thread_id = %thread, "Conversation not found, sending as a new message");
        }
        Ok(found.value.into_iter().next().map(|m| m.id))
    }
}

#[async_trait]
impl MailProvider for OutlookProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    async fn search(&self, query: &str, max: u32) -> Result<SearchPage> {
        let graph = to_graph_filter(&parse_query(query), Utc::now());
        if !graph.unsupported.is_empty() {
            debug!(unsupported = ?graph.unsupported, "Query fragments not supported by Graph");
        }

        let folder_id = match &graph.folder {
            Some(folder) => {
                match self.folder_id(folder, false, None).await? {
                    Some(id) => Some(id),
                    // No such folder, so nothing can match.
                    None => {
                        return Ok(SearchPage {
                            messages: Vec::new(),
                            native_query: graph.filter.unwrap_or_default(),
                            unsupported: graph.unsupported,
                        })
                    }
                }
            }
            None => None,
        };

        let mut params = vec![("$select", MESSAGE_SELECT.to_string())];
        match &graph.filter {
            Some(filter) => params.push(("$filter", filter.clone())),
            // Graph rejects $orderby on properties absent from $filter.
            None => params.push(("$orderby", "receivedDateTime desc".to_string())),
        }

        let endpoint = Self::messages_endpoint(folder_id.as_deref());
        let messages = self.collect_messages(&endpoint, params, max).await?;

        Ok(SearchPage {
            messages: messages.into_iter().map(normalize).collect(),
            native_query: graph.filter.unwrap_or_default(),
            unsupported: graph.unsupported,
        })
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<String> {
        let id = self.draft(email).await?;
        let token = self.token.get().await?;
        self.api
            .execute::<Value>(Method::POST, token, &format!("/me/messages/{id}/send"), None)
            .await?;
        info!(user_id = %self.connection().user_id, message_id = %id, "Sent Outlook message");
        Ok(id)
    }

    async fn create_draft(&self, email: &OutgoingEmail) -> Result<String> {
        self.draft(email).await
    }

    async fn modify_flags(
        &self,
        ids: &[MessageId],
        add: &[MessageFlag],
        remove: &[MessageFlag],
    ) -> Result<usize> {
        let mut patch = Map::new();
        let changes = add
            .iter()
            .map(|f| (*f, true))
            .chain(remove.iter().map(|f| (*f, false)));
        for (flag, set) in changes {
            if let Some(Value::Object(fields)) = graph_patch_for_flag(flag, set) {
                patch.extend(fields);
            }
        }
        if patch.is_empty() || ids.is_empty() {
            return Ok(0);
        }

        let token = self.token.get().await?;
        let body = Value::Object(patch);
        let mut touched = 0;
        for id in ids {
            let endpoint = format!("/me/messages/{}", id.as_str());
            match self.api.execute(Method::PATCH, token, &endpoint, Some(&body)).await {
                Ok(()) => touched += 1,
                Err(ProviderError::NotFound(_)) => {
                    debug!(message_id = %id, "Message gone, flag change skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(touched)
    }

    async fn apply_labels(
        &self,
        ids: &[MessageId],
        add: &[String],
        remove: &[String],
        cache: &RequestCache,
    ) -> Result<LabelChange> {
        if !remove.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "Outlook folders cannot be removed from a message".to_string(),
            ));
        }
        let Some(target) = add.first() else {
            return Ok(LabelChange::default());
        };
        if add.len() > 1 {
            warn!(
                applied = %target,
                ignored = add.len() - 1,
                "A message can only live in one Outlook folder"
            );
        }

        let folder =
            well_known_folder(target).unwrap_or_else(|| GraphFolder::Named(target.clone()));
        let destination = self
            .folder_id(&folder, true, Some(cache))
            .await?
            .ok_or_else(|| ProviderError::Internal(format!("folder {target} unavailable")))?;
        let messages = self.move_to(ids, &destination).await?;

        Ok(LabelChange {
            messages,
            added: vec![target.clone()],
            removed: Vec::new(),
        })
    }

    async fn archive(&self, ids: &[MessageId]) -> Result<usize> {
        self.move_to(ids, "archive").await
    }

    async fn trash(&self, ids: &[MessageId]) -> Result<usize> {
        self.move_to(ids, "deleteditems").await
    }

    async fn find_unsubscribable(&self, max: u32) -> Result<Vec<UnsubscribeCandidate>> {
        let messages = self
            .collect_messages(
                &Self::messages_endpoint(Some("inbox")),
                vec![
                    ("$select", UNSUBSCRIBE_SELECT.to_string()),
                    ("$orderby", "receivedDateTime desc".to_string()),
                ],
                self.unsubscribe_scan,
            )
            .await?;

        let scanned = messages.into_iter().filter_map(|msg| {
            let methods = unsubscribe_methods(&msg);
            let sender = msg.from.as_ref().and_then(GraphRecipient::to_address)?;
            Some(ScannedMessage {
                sender,
                date: msg.received_date_time.unwrap_or_else(Utc::now),
                message_id: MessageId(msg.id),
                methods,
            })
        });
        Ok(group_by_sender(scanned, max as usize))
    }

    async fn unsubscribe(&self, candidate: &UnsubscribeCandidate) -> Result<()> {
        let mut last_error = None;

        for method in &candidate.methods {
            let attempt = match method {
                UnsubscribeMethod::Native => {
                    let token = self.token.get().await?;
                    let endpoint = format!("/me/messages/{}/unsubscribe", candidate.message_id);
                    self.api
                        .execute::<Value>(Method::POST, token, &endpoint, None)
                        .await
                        .map(|_| true)
                }
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
                web => unsubscribe_via_web(self.api.http(), web).await,
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
        let token = self.token.get().await?;
        let inbox: GraphFolderResource = self.api.get(token, "/me/mailFolders/inbox", &[]).await?;
        let folders: Collection<GraphFolderResource> = self
            .api
            .get(
                token,
                "/me/mailFolders",
                &[
                    ("$select", "id,totalItemCount,unreadItemCount".to_string()),
                    ("$top", "250".to_string()),
                ],
            )
            .await?;

        Ok(MailboxStats {
            total_messages: folders.value.iter().map(|f| f.total_item_count).sum(),
            unread_messages: folders.value.iter().map(|f| f.unread_item_count).sum(),
            inbox_total: inbox.total_item_count,
            inbox_unread: inbox.unread_item_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{adapter_parts, Route, StubApi};
    use pretty_assertions::assert_eq;

    async fn provider(api: &StubApi) -> OutlookProvider {
        let (connection, tokens) = adapter_parts(ProviderKind::Outlook).await;
        OutlookProvider::new(connection, tokens, reqwest::Client::new()).with_base_url(api.base())
    }

    fn graph_message(id: &str) -> Value {
        json!({
            "id": id,
            "conversationId": format!("conv-{id}"),
            "from": {"emailAddress": {"name": "Shop", "address": "deals@shop.com"}},
            "receivedDateTime": "2025-01-02T03:04:05Z",
            "isRead": false
        })
    }

    #[tokio::test]
    async fn search_follows_next_link_until_max() {
        let api = StubApi::start(vec![
            Route::ok(
                "GET",
                "/me/messages",
                json!({"value": [graph_message("m3"), graph_message("m4")],
                       "@odata.nextLink": "{base}/me/messages?page=3"}),
            )
            .when_query("page=2"),
            Route::ok(
                "GET",
                "/me/messages",
                json!({"value": [graph_message("m1"), graph_message("m2")],
                       "@odata.nextLink": "{base}/me/messages?page=2"}),
            ),
        ])
        .await;

        let page = provider(&api).await.search("", 3).await.unwrap();

        let ids: Vec<&str> = page.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(page.messages[0].from.email, "deals@shop.com");

        let requests = api.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("%24top=3"));
        assert_eq!(requests[1], "GET /me/messages?page=2");
    }

    #[tokio::test]
    async fn archive_counts_only_messages_that_moved() {
        let api = StubApi::start(vec![
            Route::ok("POST", "/me/messages/m1/move", json!({"id": "m1-moved"})),
            Route::status("POST", "/me/messages/gone/move", 404, r#"{"error":{}}"#),
        ])
        .await;
        let ids = [MessageId::from("m1"), MessageId::from("gone")];

        let moved = provider(&api).await.archive(&ids).await.unwrap();

        assert_eq!(moved, 1);
        assert_eq!(
            api.requests(),
            vec!["POST /me/messages/m1/move", "POST /me/messages/gone/move"]
        );
    }

    #[tokio::test]
    async fn move_failure_other_than_not_found_aborts() {
        let api = StubApi::start(vec![Route::status(
            "POST",
            "/me/messages/m1/move",
            503,
            "busy",
        )])
        .await;

        let err = provider(&api)
            .await
            .trash(&[MessageId::from("m1"), MessageId::from("m2")])
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Api { status: 503, .. }));
        assert_eq!(api.requests().len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_response_is_auth_expired() {
        let api = StubApi::start(vec![Route::status(
            "GET",
            "/me/messages",
            401,
            r#"{"error":{"code":"InvalidAuthenticationToken"}}"#,
        )])
        .await;

        let err = provider(&api).await.search("is:unread", 10).await.unwrap_err();

        assert!(matches!(err, ProviderError::AuthExpired(_)));
    }

    #[test]
    fn flags_map_both_directions() {
        let flags = graph_flags(false, false, Some("high"), Some("flagged"));
        assert_eq!(
            flags.iter().copied().collect::<Vec<_>>(),
            vec![MessageFlag::Unread, MessageFlag::Important, MessageFlag::Starred]
        );
        assert!(graph_flags(true, false, Some("normal"), Some("notFlagged")).is_empty());

        assert_eq!(
            graph_patch_for_flag(MessageFlag::Unread, false),
            Some(json!({"isRead": true}))
        );
        assert_eq!(
            graph_patch_for_flag(MessageFlag::Starred, true),
            Some(json!({"flag": {"flagStatus": "flagged"}}))
        );
        assert_eq!(graph_patch_for_flag(MessageFlag::Draft, true), None);
    }

    #[test]
    fn normalizes_graph_message() {
        let json = r#"{
            "id": "AAMk1",
            "conversationId": "AAQk9",
            "from": {"emailAddress": {"name": "Shop", "address": "deals@shop.com"}},
            "toRecipients": [{"emailAddress": {"name": "", "address": "me@outlook.com"}}],
            "subject": "50% off",
            "receivedDateTime": "2025-01-02T03:04:05Z",
            "bodyPreview": "This week only",
            "isRead": false,
            "isDraft": false,
            "importance": "normal",
            "flag": {"flagStatus": "notFlagged"},
            "hasAttachments": true,
            "parentFolderId": "inbox-id"
        }"#;
        let msg: GraphMessage = serde_json::from_str(json).unwrap();
        let normalized = normalize(msg);

        assert_eq!(normalized.id, MessageId::from("AAMk1"));
        assert_eq!(normalized.thread_id, ThreadId::from("AAQk9"));
        assert_eq!(normalized.from, Address::with_name("deals@shop.com", "Shop"));
        assert_eq!(normalized.to, vec![Address::new("me@outlook.com")]);
        assert_eq!(normalized.date.to_rfc3339(), "2025-01-02T03:04:05+00:00");
        assert!(normalized.has_flag(MessageFlag::Unread));
        assert!(normalized.has_attachments);
        assert_eq!(normalized.native_labels, vec!["inbox-id".to_string()]);
    }

    #[test]
    fn unsubscribe_methods_prefer_web_then_native() {
        let json = r#"{
            "id": "AAMk2",
            "unsubscribeEnabled": true,
            "unsubscribeData": ["<mailto:leave@list.com>", "<https://list.com/u/1>"]
        }"#;
        let msg: GraphMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            unsubscribe_methods(&msg),
            vec![
                UnsubscribeMethod::Http {
                    url: "https://list.com/u/1".to_string()
                },
                UnsubscribeMethod::Native,
                UnsubscribeMethod::Mailto {
                    address: "leave@list.com".to_string(),
                    subject: None,
                    body: None,
                },
            ]
        );
    }

    #[test]
    fn outgoing_body_uses_html_when_present() {
        let mut email = OutgoingEmail::new(vec![Address::new("a@example.com")], "Hi", "plain");
        let value = serde_json::to_value(GraphOutgoing::from_email(&email)).unwrap();
        assert_eq!(value["body"]["contentType"], "Text");
        assert!(value.get("ccRecipients").is_none());

        email.body_html = Some("<b>hi</b>".to_string());
        let value = serde_json::to_value(GraphOutgoing::from_email(&email)).unwrap();
        assert_eq!(value["body"]["contentType"], "HTML");
        assert_eq!(
            value["toRecipients"][0]["emailAddress"]["address"],
            "a@example.com"
        );
    }

    #[test]
    fn capabilities_exclude_label_removal() {
        assert!(CAPABILITIES.supports(Capability::AddLabels));
        assert!(!CAPABILITIES.supports(Capability::RemoveLabels));
    }
}
