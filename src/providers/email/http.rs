//! Authenticated JSON requests against a provider REST API.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;

use super::{ProviderError, Result};
use crate::domain::EmailConnection;
use crate::vault::TokenManager;

/// Access token for one connection, resolved at most once per adapter.
pub(crate) struct BearerToken {
    connection: EmailConnection,
    tokens: Arc<TokenManager>,
    cell: OnceCell<String>,
}

impl BearerToken {
    pub(crate) fn new(connection: EmailConnection, tokens: Arc<TokenManager>) -> Self {
        Self {
            connection,
            tokens,
            cell: OnceCell::new(),
        }
    }

    pub(crate) fn connection(&self) -> &EmailConnection {
        &self.connection
    }

    pub(crate) async fn get(&self) -> Result<&str> {
        let token = self
            .cell
            .get_or_try_init(|| async {
                self.tokens
                    .access_token(&self.connection)
                    .await
                    .map_err(ProviderError::from)
            })
            .await?;
        Ok(token.as_str())
    }
}

/// Thin wrapper over `reqwest` that adds bearer auth and maps error statuses.
#[derive(Debug, Clone)]
pub(crate) struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    pub(crate) fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
            endpoint.to_string()
        } else {
            format!("{}{}", self.base, endpoint)
        }
    }

    /// Builds authorization headers for API requests.
    fn auth_headers(token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProviderError::Internal(format!("invalid header: {e}")))?,
        );
        Ok(headers)
    }

    pub(crate) fn request(
        &self,
        method: Method,
        token: &str,
        endpoint: &str,
    ) -> Result<RequestBuilder> {
        Ok(self
            .http
            .request(method, self.url(endpoint))
            .headers(Self::auth_headers(token)?))
    }

    async fn send(builder: RequestBuilder) -> Result<Response> {
        builder
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))
    }

    /// Makes an authenticated GET request.
    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        token: &str,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = Self::send(self.request(Method::GET, token, endpoint)?.query(query)).await?;
        handle_response(response).await
    }

    /// Makes an authenticated POST request with a JSON body.
    pub(crate) async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        token: &str,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let response = Self::send(self.request(Method::POST, token, endpoint)?.json(body)).await?;
        handle_response(response).await
    }

    /// Makes an authenticated request whose response body is ignored.
    pub(crate) async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        token: &str,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<()> {
        let mut builder = self.request(method, token, endpoint)?;
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = Self::send(builder).await?;
        if !response.status().is_success() {
            return Err(handle_error(response).await);
        }
        Ok(())
    }
}

/// Handles API response, checking for errors.
pub(crate) async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(handle_error(response).await);
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::Internal(format!("parse response: {e}")))
}

/// Handles API error responses.
pub(crate) async fn handle_error(response: Response) -> ProviderError {
    let status = response.status();
    let retry_after_secs = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let body = response.text().await.unwrap_or_default();
    error_for_status(status, body, retry_after_secs)
}

pub(crate) fn error_for_status(
    status: StatusCode,
    body: String,
    retry_after_secs: Option<u64>,
) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED => ProviderError::AuthExpired(format!("unauthorized: {body}")),
        StatusCode::NOT_FOUND => ProviderError::NotFound(body),
        StatusCode::BAD_REQUEST => ProviderError::InvalidRequest(body),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after_secs },
        _ => ProviderError::Api {
            status: status.as_u16(),
            message: body,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            error_for_status(StatusCode::UNAUTHORIZED, "expired".into(), None),
            ProviderError::AuthExpired(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::NOT_FOUND, String::new(), None),
            ProviderError::NotFound(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::TOO_MANY_REQUESTS, String::new(), Some(12)),
            ProviderError::RateLimited {
                retry_after_secs: Some(12)
            }
        ));
        assert!(matches!(
            error_for_status(StatusCode::BAD_GATEWAY, "upstream".into(), None),
            ProviderError::Api { status: 502, .. }
        ));
    }

    #[test]
    fn absolute_endpoints_bypass_base() {
        let client = ApiClient::new(reqwest::Client::new(), "https://api.example.com/v1");
        assert_eq!(client.url("/messages"), "https://api.example.com/v1/messages");
        assert_eq!(
            client.url("https://api.example.com/v1/messages?$skip=10"),
            "https://api.example.com/v1/messages?$skip=10"
        );
    }
}
