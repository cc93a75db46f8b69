//! Gmail REST provider.
//!
//! Refreshes tokens through Google's OAuth token endpoint and lists unread
//! messages through the Gmail v1 API, fetching each message in `full` format
//! to extract headers and the plain-text body.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::ProviderError;
use crate::mail::provider::{FetchOptions, MailProvider, RefreshedToken};
use crate::model::{Envelope, MailAccount};

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Gmail OAuth client configuration.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub client_id: SecretString,
    pub client_secret: SecretString,
    pub token_url: String,
    pub api_base: String,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            client_id: SecretString::from(String::new()),
            client_secret: SecretString::from(String::new()),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: Duration::from_secs(20),
        }
    }
}

pub struct GmailProvider {
    client: reqwest::Client,
    config: GmailConfig,
}

impl GmailProvider {
    pub fn new(config: GmailConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

fn network_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Network(format!("timed out: {e}"))
    } else {
        ProviderError::Network(e.to_string())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePart>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct PartBody {
    #[serde(default)]
    data: Option<String>,
}

fn header(part: &MessagePart, name: &str) -> String {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
        .unwrap_or_default()
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// First `text/plain` body found depth-first.
fn plain_text(part: &MessagePart) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case("text/plain")
        && let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref())
    {
        return decode_body(data);
    }
    part.parts.iter().find_map(plain_text)
}

fn to_envelope(message: GmailMessage) -> Envelope {
    let payload = message.payload.unwrap_or_default();
    let date: Option<DateTime<Utc>> = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    Envelope {
        id: message.id,
        thread_id: message.thread_id,
        from: header(&payload, "From"),
        to: header(&payload, "To"),
        cc: header(&payload, "Cc"),
        bcc: header(&payload, "Bcc"),
        subject: header(&payload, "Subject"),
        snippet: message.snippet,
        body: plain_text(&payload).unwrap_or_default(),
        date,
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn id(&self) -> &str {
        "gmail"
    }

    async fn refresh_access_token(
        &self,
        account: &MailAccount,
    ) -> Result<RefreshedToken, ProviderError> {
        let refresh_token = account
            .credential
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ProviderError::MissingRefreshToken)?;

        let form = [
            ("client_id", self.config.client_id.expose_secret()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(RefreshedToken {
            access_token: token.access_token,
            expires_in_secs: token.expires_in,
            refresh_token: token.refresh_token,
        })
    }

    async fn fetch_unread(
        &self,
        account: &MailAccount,
        access_token: &str,
        options: &FetchOptions,
    ) -> Result<Vec<Envelope>, ProviderError> {
        let mut query = vec![("maxResults", options.max.max(1).to_string())];
        if options.unread_only {
            query.push(("q", "is:unread".to_string()));
        }
        let list: ListResponse = self
            .get_json(&self.api("/users/me/messages"), access_token, &query)
            .await?;

        let mut envelopes = Vec::with_capacity(list.messages.len());
        for message in list.messages.into_iter().take(options.max) {
            let url = self.api(&format!("/users/me/messages/{}", message.id));
            let full: GmailMessage = self
                .get_json(&url, access_token, &[("format", "full".to_string())])
                .await?;
            envelopes.push(to_envelope(full));
        }
        debug!(account = %account.id, count = envelopes.len(), "Listed Gmail messages");
        Ok(envelopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Credential;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://127.0.0.1:{port}")
    }

    fn provider(base: &str) -> GmailProvider {
        GmailProvider::new(GmailConfig {
            token_url: format!("{base}/token"),
            api_base: format!("{base}/gmail/v1"),
            ..GmailConfig::default()
        })
    }

    fn account(refresh: Option<&str>) -> MailAccount {
        MailAccount::new("a1", "gmail", "me@example.com").with_credential(Credential {
            access_token: None,
            refresh_token: refresh.map(String::from),
            expiry: None,
        })
    }

    #[tokio::test]
    async fn refresh_parses_token_response() {
        let app = Router::new().route(
            "/token",
            post(|| async { Json(json!({"access_token": "ya29.new", "expires_in": 3599})) }),
        );
        let base = serve(app).await;
        let token = provider(&base)
            .refresh_access_token(&account(Some("1//r")))
            .await
            .unwrap();
        assert_eq!(token.access_token, "ya29.new");
        assert_eq!(token.expires_in_secs, Some(3599));
        assert!(token.refresh_token.is_none());
    }

    #[tokio::test]
    async fn refresh_surfaces_invalid_grant_body() {
        let app = Router::new().route(
            "/token",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid_grant", "error_description": "Token has been expired or revoked."})),
                )
            }),
        );
        let base = serve(app).await;
        let err = provider(&base)
            .refresh_access_token(&account(Some("1//r")))
            .await
            .unwrap_err();
        match err {
            ProviderError::Http { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_without_token_fails_fast() {
        let err = provider("http://127.0.0.1:9")
            .refresh_access_token(&account(None))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MissingRefreshToken));
    }

    #[tokio::test]
    async fn fetch_extracts_headers_and_plain_body() {
        let body = URL_SAFE_NO_PAD.encode("Hello from the body");
        let app = Router::new()
            .route(
                "/gmail/v1/users/me/messages",
                get(|| async { Json(json!({"messages": [{"id": "m1", "threadId": "t1"}]})) }),
            )
            .route(
                "/gmail/v1/users/me/messages/{id}",
                get(move |Path(id): Path<String>| {
                    let body = body.clone();
                    async move {
                        Json::<Value>(json!({
                            "id": id,
                            "threadId": "t1",
                            "snippet": "Hello",
                            "internalDate": "1700000000000",
                            "payload": {
                                "mimeType": "multipart/alternative",
                                "headers": [
                                    {"name": "From", "value": "Alice <alice@example.com>"},
                                    {"name": "To", "value": "me@example.com"},
                                    {"name": "Subject", "value": "Invoice 42"}
                                ],
                                "parts": [
                                    {"mimeType": "text/html", "body": {"data": "PGI-aGk8L2I-"}},
                                    {"mimeType": "text/plain", "body": {"data": body}}
                                ]
                            }
                        }))
                    }
                }),
            );
        let base = serve(app).await;
        let envelopes = provider(&base)
            .fetch_unread(&account(Some("r")), "ya29", &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(envelopes.len(), 1);
        let env = &envelopes[0];
        assert_eq!(env.id, "m1");
        assert_eq!(env.thread_id.as_deref(), Some("t1"));
        assert_eq!(env.from, "Alice <alice@example.com>");
        assert_eq!(env.subject, "Invoice 42");
        assert_eq!(env.body, "Hello from the body");
        assert_eq!(env.date.unwrap().timestamp_millis(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn fetch_maps_http_errors() {
        let app = Router::new().route(
            "/gmail/v1/users/me/messages",
            get(|| async { (StatusCode::UNAUTHORIZED, "bad token") }),
        );
        let base = serve(app).await;
        let err = provider(&base)
            .fetch_unread(&account(Some("r")), "stale", &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 401, .. }));
    }
}
