//! In-memory mailbox fakes shared by unit tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::domain::{
    Address, EmailConnection, LabelChange, MailboxStats, MessageFlag, MessageId,
    NormalizedMessage, OutgoingEmail, ProviderKind, ThreadId, UnsubscribeCandidate,
    UnsubscribeMethod, UserId,
};
use crate::providers::email::query::{parse_query, Term};
use crate::providers::email::{
    Capabilities, Capability, MailProvider, ProviderError, ProviderFactory, RequestCache, Result,
    SearchPage,
};
use crate::storage::{ConnectionStore, Database, SqliteStore};
use crate::vault::{CredentialVault, MockOAuthClient, TokenManager};

const ALL: &[Capability] = &[
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
];

const WITHOUT_LABEL_REMOVAL: &[Capability] = &[
    Capability::Search,
    Capability::Send,
    Capability::Drafts,
    Capability::Flags,
    Capability::AddLabels,
    Capability::Archive,
    Capability::Trash,
    Capability::Unsubscribe,
    Capability::Stats,
];

#[derive(Default)]
struct MailboxState {
    inbox: Vec<NormalizedMessage>,
    archived: Vec<MessageId>,
    trashed: Vec<MessageId>,
    labels: HashMap<MessageId, BTreeSet<String>>,
    sent: Vec<OutgoingEmail>,
    candidates: Vec<UnsubscribeCandidate>,
    unsubscribed: Vec<String>,
    rejected_senders: HashSet<String>,
    failure: Option<String>,
    auth_expired: bool,
}

/// Handle on one fake mailbox; clones share state.
#[derive(Clone, Default)]
pub(crate) struct Mailbox(Arc<Mutex<MailboxState>>);

impl Mailbox {
    fn state(&self) -> std::sync::MutexGuard<'_, MailboxState> {
        self.0.lock().unwrap()
    }

    pub(crate) fn add(&self, message: NormalizedMessage) {
        self.state().inbox.push(message);
    }

    pub(crate) fn add_candidate(&self, candidate: UnsubscribeCandidate) {
        self.state().candidates.push(candidate);
    }

    /// Every call fails with a provider API error carrying `message`.
    pub(crate) fn fail_with(&self, message: &str) {
        self.state().failure = Some(message.to_string());
    }

    pub(crate) fn expire_auth(&self) {
        self.state().auth_expired = true;
    }

    pub(crate) fn reject_unsubscribe(&self, sender: &str) {
        self.state().rejected_senders.insert(sender.to_string());
    }

    pub(crate) fn message(&self, id: &str) -> Option<NormalizedMessage> {
        self.state().inbox.iter().find(|m| m.id.as_str() == id).cloned()
    }

    pub(crate) fn archived(&self) -> Vec<MessageId> {
        self.state().archived.clone()
    }

    pub(crate) fn trashed(&self) -> Vec<MessageId> {
        self.state().trashed.clone()
    }

    pub(crate) fn labels_of(&self, id: &str) -> BTreeSet<String> {
        self.state()
            .labels
            .get(&MessageId::from(id))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn sent(&self) -> Vec<OutgoingEmail> {
        self.state().sent.clone()
    }

    pub(crate) fn unsubscribed(&self) -> Vec<String> {
        self.state().unsubscribed.clone()
    }

    fn check(&self) -> Result<()> {
        let state = self.state();
        if state.auth_expired {
            return Err(ProviderError::AuthExpired("invalid_grant".to_string()));
        }
        match &state.failure {
            Some(message) => Err(ProviderError::Api {
                status: 502,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

struct FakeProvider {
    kind: ProviderKind,
    mailbox: Mailbox,
}

fn query_matches(message: &NormalizedMessage, query: &str) -> bool {
    parse_query(query).clauses.iter().all(|clause| match &clause.term {
        Term::From(sender) => message.from.email.contains(sender.as_str()) != clause.negated,
        _ => true,
    })
}

#[async_trait]
impl MailProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        match self.kind {
            ProviderKind::Gmail => Capabilities::new(ALL),
            ProviderKind::Outlook => Capabilities::new(WITHOUT_LABEL_REMOVAL),
        }
    }

    async fn search(&self, query: &str, max: u32) -> Result<SearchPage> {
        self.mailbox.check()?;
        let messages = self
            .mailbox
            .state()
            .inbox
            .iter()
            .filter(|m| query_matches(m, query))
            .take(max as usize)
            .cloned()
            .collect();
        Ok(SearchPage {
            messages,
            native_query: query.to_string(),
            unsupported: Vec::new(),
        })
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<String> {
        self.mailbox.check()?;
        let mut state = self.mailbox.state();
        state.sent.push(email.clone());
        Ok(format!("sent-{}", state.sent.len()))
    }

    async fn create_draft(&self, _email: &OutgoingEmail) -> Result<String> {
        self.mailbox.check()?;
        Ok("draft-1".to_string())
    }

    async fn modify_flags(
        &self,
        ids: &[MessageId],
        add: &[MessageFlag],
        remove: &[MessageFlag],
    ) -> Result<usize> {
        self.mailbox.check()?;
        let mut state = self.mailbox.state();
        let mut touched = 0;
        for message in state.inbox.iter_mut().filter(|m| ids.contains(&m.id)) {
            message.flags.extend(add.iter().copied());
            for flag in remove {
                message.flags.remove(flag);
            }
            touched += 1;
        }
        Ok(touched)
    }

    async fn apply_labels(
        &self,
        ids: &[MessageId],
        add: &[String],
        remove: &[String],
        _cache: &RequestCache,
    ) -> Result<LabelChange> {
        self.mailbox.check()?;
        let mut state = self.mailbox.state();
        for id in ids {
            let labels = state.labels.entry(id.clone()).or_default();
            labels.extend(add.iter().cloned());
            for label in remove {
                labels.remove(label);
            }
        }
        Ok(LabelChange {
            messages: ids.len(),
            added: add.to_vec(),
            removed: remove.to_vec(),
        })
    }

    async fn archive(&self, ids: &[MessageId]) -> Result<usize> {
        self.mailbox.check()?;
        let mut state = self.mailbox.state();
        state.inbox.retain(|m| !ids.contains(&m.id));
        state.archived.extend(ids.iter().cloned());
        Ok(ids.len())
    }

    async fn trash(&self, ids: &[MessageId]) -> Result<usize> {
        self.mailbox.check()?;
        let mut state = self.mailbox.state();
        state.inbox.retain(|m| !ids.contains(&m.id));
        state.trashed.extend(ids.iter().cloned());
        Ok(ids.len())
    }

    async fn find_unsubscribable(&self, max: u32) -> Result<Vec<UnsubscribeCandidate>> {
        self.mailbox.check()?;
        Ok(self
            .mailbox
            .state()
            .candidates
            .iter()
            .take(max as usize)
            .cloned()
            .collect())
    }

    async fn unsubscribe(&self, candidate: &UnsubscribeCandidate) -> Result<()> {
        self.mailbox.check()?;
        let mut state = self.mailbox.state();
        if state.rejected_senders.contains(&candidate.sender.email) {
            return Err(ProviderError::Api {
                status: 500,
                message: "unsubscribe endpoint failed".to_string(),
            });
        }
        state.unsubscribed.push(candidate.sender.email.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<MailboxStats> {
        self.mailbox.check()?;
        let state = self.mailbox.state();
        let unread = state
            .inbox
            .iter()
            .filter(|m| m.has_flag(MessageFlag::Unread))
            .count() as u64;
        let total = (state.inbox.len() + state.archived.len()) as u64;
        Ok(MailboxStats {
            total_messages: total,
            unread_messages: unread,
            inbox_total: state.inbox.len() as u64,
            inbox_unread: unread,
        })
    }
}

/// Builds fake adapters over shared in-memory mailboxes.
#[derive(Clone, Default)]
pub(crate) struct FakeFactory {
    mailboxes: Arc<Mutex<HashMap<ProviderKind, Mailbox>>>,
    built: Arc<Mutex<Vec<ProviderKind>>>,
}

impl FakeFactory {
    pub(crate) fn mailbox(&self, kind: ProviderKind) -> Mailbox {
        self.mailboxes
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .clone()
    }

    pub(crate) fn built(&self) -> Vec<ProviderKind> {
        self.built.lock().unwrap().clone()
    }
}

impl ProviderFactory for FakeFactory {
    fn build(&self, connection: EmailConnection) -> Box<dyn MailProvider> {
        self.built.lock().unwrap().push(connection.provider);
        Box::new(FakeProvider {
            kind: connection.provider,
            mailbox: self.mailbox(connection.provider),
        })
    }
}

/// Stores a connection with plaintext tokens that never expire.
pub(crate) async fn connect(
    store: &impl ConnectionStore,
    user_id: &UserId,
    provider: ProviderKind,
) {
    let now = Utc::now();
    store
        .upsert_connection(&EmailConnection {
            user_id: user_id.clone(),
            provider,
            account_email: format!("{user_id}@{provider}.example.com"),
            access_token_enc: "access".to_string(),
            refresh_token_enc: Some("refresh".to_string()),
            expires_at: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
}

/// An unread inbox message from `from`.
pub(crate) fn message(id: &str, from: &str) -> NormalizedMessage {
    NormalizedMessage {
        id: MessageId::from(id),
        thread_id: ThreadId::from(format!("thread-{id}").as_str()),
        from: Address::new(from),
        to: vec![Address::new("me@example.com")],
        subject: Some(format!("Message {id}")),
        date: Utc::now() - Duration::days(1),
        snippet: String::new(),
        flags: BTreeSet::from([MessageFlag::Unread]),
        has_attachments: false,
        native_labels: vec!["INBOX".to_string()],
    }
}

pub(crate) fn with_flag(mut message: NormalizedMessage, flag: MessageFlag) -> NormalizedMessage {
    message.flags.insert(flag);
    message
}

pub(crate) fn candidate(sender: &str) -> UnsubscribeCandidate {
    UnsubscribeCandidate {
        sender: Address::new(sender),
        message_id: MessageId::from(format!("latest-{sender}").as_str()),
        message_count: 3,
        methods: vec![UnsubscribeMethod::OneClick {
            url: format!("https://{sender}/unsubscribe"),
        }],
    }
}

/// One canned reply of a [`StubApi`].
#[derive(Debug, Clone)]
pub(crate) struct Route {
    method: &'static str,
    path: String,
    query: Option<&'static str>,
    status: u16,
    body: String,
}

impl Route {
    /// Answers `method path` with a 200 JSON body.
    pub(crate) fn ok(method: &'static str, path: &str, body: serde_json::Value) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: None,
            status: 200,
            body: body.to_string(),
        }
    }

    pub(crate) fn status(method: &'static str, path: &str, status: u16, body: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: None,
            status,
            body: body.to_string(),
        }
    }

    /// Only matches when the query string contains `fragment`.
    pub(crate) fn when_query(mut self, fragment: &'static str) -> Self {
        self.query = Some(fragment);
        self
    }

    fn matches(&self, method: &str, path: &str, query: &str) -> bool {
        self.method == method
            && self.path == path
            && self.query.map_or(true, |fragment| query.contains(fragment))
    }
}

/// Local HTTP server answering from a fixed route table and recording every
/// request line. Routes are tried in order; unmatched requests get a 500.
/// `{base}` in a body is replaced with the server's own root URL.
pub(crate) struct StubApi {
    base: String,
    requests: Arc<Mutex<Vec<String>>>,
    server: tokio::task::JoinHandle<()>,
}

impl StubApi {
    pub(crate) async fn start(routes: Vec<Route>) -> Self {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let routes = Arc::new(routes);

        let log = requests.clone();
        let root = base.clone();
        let server = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                let log = log.clone();
                let root = root.clone();
                tokio::spawn(async move {
                    let mut raw = Vec::new();
                    let mut buf = [0u8; 4096];
                    let head_end = loop {
                        let n = stream.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        raw.extend_from_slice(&buf[..n]);
                        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
                    let length = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    while raw.len() < head_end + length {
                        let n = stream.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        raw.extend_from_slice(&buf[..n]);
                    }

                    let mut parts = head.lines().next().unwrap_or_default().split(' ');
                    let method = parts.next().unwrap_or_default().to_string();
                    let target = parts.next().unwrap_or_default().to_string();
                    let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
                    log.lock().unwrap().push(format!("{method} {target}"));

                    let (status, body) = routes
                        .iter()
                        .find(|r| r.matches(&method, path, query))
                        .map(|r| (r.status, r.body.replace("{base}", &root)))
                        .unwrap_or((500, format!("no route for {method} {path}")));
                    let response = format!(
                        "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\n\
                         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            base,
            requests,
            server,
        }
    }

    pub(crate) fn base(&self) -> &str {
        &self.base
    }

    /// `METHOD /path?query` of every request received so far.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubApi {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// A connection with a plaintext, non-expiring token and a token manager
/// that must never refresh it.
pub(crate) async fn adapter_parts(provider: ProviderKind) -> (EmailConnection, Arc<TokenManager>) {
    let store = Arc::new(SqliteStore::new(Database::open_in_memory().await.unwrap()));
    let mut oauth = MockOAuthClient::new();
    oauth.expect_refresh().never();
    let vault = CredentialVault::new(&[3u8; 32]).unwrap();
    let tokens = Arc::new(TokenManager::new(vault, Arc::new(oauth), store));

    let now = Utc::now();
    let connection = EmailConnection {
        user_id: UserId::from("user-1"),
        provider,
        account_email: "me@example.com".to_string(),
        access_token_enc: "stub-access".to_string(),
        refresh_token_enc: None,
        expires_at: None,
        created_at: now,
        updated_at: now,
    };
    (connection, tokens)
}
