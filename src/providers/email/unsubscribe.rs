//! Mailing list unsubscribe discovery and web-based unsubscribe actions.
//!
//! `List-Unsubscribe` (RFC 2369) carries `<mailto:...>` and `<https://...>`
//! targets; `List-Unsubscribe-Post: List-Unsubscribe=One-Click` (RFC 8058)
//! upgrades the HTTPS target to a one-click POST.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

use super::http::error_for_status;
use super::{ProviderError, Result};
use crate::domain::{Address, MessageId, UnsubscribeCandidate, UnsubscribeMethod};

const ONE_CLICK_BODY: &str = "List-Unsubscribe=One-Click";

fn parse_mailto(target: &str) -> Option<UnsubscribeMethod> {
    let url = Url::parse(target).ok()?;
    let address = url.path().trim().to_string();
    if address.is_empty() || !address.contains('@') {
        return None;
    }
    let mut subject = None;
    let mut body = None;
    for (key, value) in url.query_pairs() {
        match key.to_ascii_lowercase().as_str() {
            "subject" => subject = Some(value.into_owned()),
            "body" => body = Some(value.into_owned()),
            _ => {}
        }
    }
    Some(UnsubscribeMethod::Mailto {
        address,
        subject,
        body,
    })
}

/// Parses `List-Unsubscribe` and `List-Unsubscribe-Post` header values into
/// methods ordered best first: one-click, HTTPS, mailto.
///
/// Plain `http://` targets are ignored.
pub fn parse_list_unsubscribe(header: &str, post_header: Option<&str>) -> Vec<UnsubscribeMethod> {
    let one_click = post_header
        .map(|v| v.to_ascii_lowercase().contains("list-unsubscribe=one-click"))
        .unwrap_or(false);

    let mut web = Vec::new();
    let mut mail = Vec::new();
    for part in header.split(',') {
        let target = part.trim().trim_start_matches('<').trim_end_matches('>').trim();
        let lower = target.to_ascii_lowercase();
        if lower.starts_with("https://") {
            if Url::parse(target).is_err() {
                continue;
            }
            let url = target.to_string();
            web.push(if one_click {
                UnsubscribeMethod::OneClick { url }
            } else {
                UnsubscribeMethod::Http { url }
            });
        } else if lower.starts_with("mailto:") {
            mail.extend(parse_mailto(target));
        }
    }
    web.extend(mail);
    web
}

/// One scanned message that advertises unsubscribe methods.
#[derive(Debug, Clone)]
pub struct ScannedMessage {
    pub sender: Address,
    pub message_id: MessageId,
    pub date: DateTime<Utc>,
    pub methods: Vec<UnsubscribeMethod>,
}

/// Groups scanned messages by sender address.
///
/// Each candidate keeps the methods of its sender's most recent message.
/// Candidates are ordered by message count, then address, and truncated to
/// `max`.
pub fn group_by_sender(
    scanned: impl IntoIterator<Item = ScannedMessage>,
    max: usize,
) -> Vec<UnsubscribeCandidate> {
    let mut by_sender: HashMap<String, (UnsubscribeCandidate, DateTime<Utc>)> = HashMap::new();

    for message in scanned {
        if message.methods.is_empty() {
            continue;
        }
        let key = message.sender.email.to_lowercase();
        match by_sender.get_mut(&key) {
            Some((candidate, latest)) => {
                candidate.message_count += 1;
                if message.date > *latest {
                    *latest = message.date;
                    candidate.message_id = message.message_id;
                    candidate.methods = message.methods;
                }
            }
            None => {
                let candidate = UnsubscribeCandidate {
                    sender: message.sender,
                    message_id: message.message_id,
                    message_count: 1,
                    methods: message.methods,
                };
                by_sender.insert(key, (candidate, message.date));
            }
        }
    }

    let mut candidates: Vec<UnsubscribeCandidate> =
        by_sender.into_values().map(|(candidate, _)| candidate).collect();
    candidates.sort_by(|a, b| {
        b.message_count
            .cmp(&a.message_count)
            .then_with(|| a.sender.email.to_lowercase().cmp(&b.sender.email.to_lowercase()))
    });
    candidates.truncate(max);
    candidates
}

/// Executes a one-click or HTTPS method.
///
/// Returns `Ok(false)` for methods that need the provider (mailto, native).
pub(crate) async fn unsubscribe_via_web(
    http: &reqwest::Client,
    method: &UnsubscribeMethod,
) -> Result<bool> {
    let request = match method {
        UnsubscribeMethod::OneClick { url } => http
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(ONE_CLICK_BODY),
        UnsubscribeMethod::Http { url } => http.get(url),
        UnsubscribeMethod::Mailto { .. } | UnsubscribeMethod::Native => return Ok(false),
    };

    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::Connection(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(error_for_status(status, body, None));
    }
    debug!(status = %status, "Unsubscribe request accepted");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_one_click_and_mailto() {
        let methods = parse_list_unsubscribe(
            "<mailto:leave@list.example.com?subject=unsubscribe>, <https://list.example.com/u/abc>",
            Some("List-Unsubscribe=One-Click"),
        );
        assert_eq!(
            methods,
            vec![
                UnsubscribeMethod::OneClick {
                    url: "https://list.example.com/u/abc".to_string()
                },
                UnsubscribeMethod::Mailto {
                    address: "leave@list.example.com".to_string(),
                    subject: Some("unsubscribe".to_string()),
                    body: None,
                },
            ]
        );
    }

    #[test]
    fn https_without_post_header_is_plain_get() {
        let methods = parse_list_unsubscribe("<https://news.example.com/unsub?id=1>", None);
        assert_eq!(
            methods,
            vec![UnsubscribeMethod::Http {
                url: "https://news.example.com/unsub?id=1".to_string()
            }]
        );
    }

    #[test]
    fn ignores_insecure_and_malformed_targets() {
        let methods =
            parse_list_unsubscribe("<http://insecure.example.com/u>, <mailto:>, garbage", None);
        assert!(methods.is_empty());
    }

    fn scanned(email: &str, id: &str, minutes_ago: i64) -> ScannedMessage {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        ScannedMessage {
            sender: Address::new(email),
            message_id: MessageId::from(id),
            date: base - Duration::minutes(minutes_ago),
            methods: vec![UnsubscribeMethod::Http {
                url: format!("https://example.com/{id}"),
            }],
        }
    }

    #[test]
    fn groups_by_sender_and_keeps_latest_message() {
        let candidates = group_by_sender(
            vec![
                scanned("deals@shop.com", "m1", 30),
                scanned("Deals@Shop.com", "m2", 5),
                scanned("news@paper.com", "m3", 10),
                ScannedMessage {
                    methods: Vec::new(),
                    ..scanned("friend@example.com", "m4", 1)
                },
            ],
            10,
        );

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].sender.email, "deals@shop.com");
        assert_eq!(candidates[0].message_count, 2);
        assert_eq!(candidates[0].message_id, MessageId::from("m2"));
        assert_eq!(candidates[1].sender.email, "news@paper.com");
    }

    #[test]
    fn grouping_respects_max() {
        let candidates = group_by_sender(
            vec![
                scanned("a@x.com", "1", 1),
                scanned("b@x.com", "2", 2),
                scanned("c@x.com", "3", 3),
            ],
            2,
        );
        let senders: Vec<&str> = candidates.iter().map(|c| c.sender.email.as_str()).collect();
        assert_eq!(senders, vec!["a@x.com", "b@x.com"]);
    }

    #[tokio::test]
    async fn provider_methods_are_not_handled_on_the_web() {
        let http = reqwest::Client::new();
        assert!(!unsubscribe_via_web(&http, &UnsubscribeMethod::Native).await.unwrap());
    }
}
