//! Router errors and message sanitization.

use thiserror::Error;

use crate::domain::{ProviderKind, UserId};
use crate::providers::email::ProviderError;

/// Persisted and returned error messages are cut to this many characters.
pub const MAX_ERROR_LEN: usize = 500;

const REDACTED: &str = "[redacted]";

const SENSITIVE_FIELDS: [&str; 4] = ["access_token", "refresh_token", "id_token", "client_secret"];

/// Errors returned by router operations. Messages are already sanitized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("no email connection for user {0}")]
    NoConnection(UserId),

    #[error("{provider} authorization expired, reconnect the mailbox: {message}")]
    AuthExpired {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} error: {message}")]
    Provider {
        provider: ProviderKind,
        message: String,
    },

    #[error("not allowed to act for user {requested}")]
    Forbidden { requested: UserId },

    #[error("storage error: {0}")]
    Storage(String),
}

impl RouterError {
    pub(crate) fn from_provider(provider: ProviderKind, err: ProviderError) -> Self {
        match err {
            ProviderError::AuthExpired(message) => RouterError::AuthExpired {
                provider,
                message: sanitize_error(&message),
            },
            ProviderError::Storage(message) => RouterError::Storage(sanitize_error(&message)),
            other => RouterError::Provider {
                provider,
                message: sanitize_error(&other.to_string()),
            },
        }
    }
}

/// Cuts `message` to at most `max` characters.
pub fn truncate_chars(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}

fn is_value_end(c: char) -> bool {
    c.is_whitespace() || matches!(c, '&' | '"' | '\'' | ',' | ';' | '}' | ')')
}

fn redact_bearer(input: &str) -> String {
    const MARKER: &str = "bearer ";
    let lower = input.to_ascii_lowercase();
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;

    while let Some(found) = lower[pos..].find(MARKER) {
        let start = pos + found + MARKER.len();
        out.push_str(&input[pos..start]);
        let rest = &input[start..];
        let value_len = rest.find(is_value_end).unwrap_or(rest.len());
        if value_len > 0 {
            out.push_str(REDACTED);
        }
        pos = start + value_len;
    }
    out.push_str(&input[pos..]);
    out
}

/// Length of `"`? ` `* (`=`|`:`) ` `* `"`? at the start of `rest`.
fn separator_len(rest: &str) -> Option<usize> {
    let bytes = rest.as_bytes();
    let mut i = 0;
    if bytes.get(i) == Some(&b'"') {
        i += 1;
    }
    while bytes.get(i) == Some(&b' ') {
        i += 1;
    }
    match bytes.get(i) {
        Some(b'=') | Some(b':') => i += 1,
        _ => return None,
    }
    while bytes.get(i) == Some(&b' ') {
        i += 1;
    }
    if bytes.get(i) == Some(&b'"') {
        i += 1;
    }
    Some(i)
}

fn redact_field(input: &str, field: &str) -> String {
    let lower = input.to_ascii_lowercase();
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;

    while let Some(found) = lower[pos..].find(field) {
        let key_start = pos + found;
        let key_end = key_start + field.len();
        let part_of_word = input[..key_start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');

        match separator_len(&input[key_end..]) {
            Some(sep) if !part_of_word => {
                let value_start = key_end + sep;
                let value = &input[value_start..];
                let value_len = value.find(is_value_end).unwrap_or(value.len());
                out.push_str(&input[pos..value_start]);
                if value_len > 0 {
                    out.push_str(REDACTED);
                }
                pos = value_start + value_len;
            }
            _ => {
                out.push_str(&input[pos..key_end]);
                pos = key_end;
            }
        }
    }
    out.push_str(&input[pos..]);
    out
}

/// Removes credentials from a provider message and truncates it.
///
/// Bearer tokens and token-bearing query, form or JSON fields are replaced
/// with `[redacted]`; the result is at most [`MAX_ERROR_LEN`] characters.
pub fn sanitize_error(message: &str) -> String {
    let mut text = redact_bearer(message);
    for field in SENSITIVE_FIELDS {
        text = redact_field(&text, field);
    }
    truncate_chars(&text, MAX_ERROR_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn redacts_bearer_tokens() {
        assert_eq!(
            sanitize_error("request failed: Authorization: Bearer ya29.a0Af-xyz, retry later"),
            "request failed: Authorization: Bearer [redacted], retry later"
        );
    }

    #[test]
    fn redacts_query_form_and_json_fields() {
        assert_eq!(
            sanitize_error("POST /token?refresh_token=1//0abc&grant_type=refresh_token"),
            "POST /token?refresh_token=[redacted]&grant_type=refresh_token"
        );
        assert_eq!(
            sanitize_error(r#"{"access_token": "secret-value", "expires_in": 3599}"#),
            r#"{"access_token": "[redacted]", "expires_in": 3599}"#
        );
        assert_eq!(
            sanitize_error("client_secret=abc123"),
            "client_secret=[redacted]"
        );
    }

    #[test]
    fn leaves_similar_words_alone() {
        let message = "my_access_token_store=fine and status code: 401";
        assert_eq!(sanitize_error(message), message);
    }

    #[test]
    fn truncates_to_limit_on_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_LEN + 20);
        let sanitized = sanitize_error(&long);
        assert_eq!(sanitized.chars().count(), MAX_ERROR_LEN);
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn provider_errors_map_and_sanitize() {
        let err = RouterError::from_provider(
            ProviderKind::Gmail,
            ProviderError::Api {
                status: 500,
                message: "echo: Bearer abc.def".to_string(),
            },
        );
        assert_eq!(
            err,
            RouterError::Provider {
                provider: ProviderKind::Gmail,
                message: "API error (500): echo: Bearer [redacted]".to_string(),
            }
        );

        let err = RouterError::from_provider(
            ProviderKind::Outlook,
            ProviderError::AuthExpired("invalid_grant".to_string()),
        );
        assert!(matches!(err, RouterError::AuthExpired { provider: ProviderKind::Outlook, .. }));
    }
}
