//! JSON REST calls against `*.googleapis.com`.

use std::error::Error as StdError;
use std::time::Duration;

use common::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rate_limit::RateLimiter;

/// Upper bound on pages fetched by `list_all`, against runaway tokens.
const MAX_PAGES: usize = 200;

fn format_reqwest_error(err: &reqwest::Error) -> String {
    // Keep chained causes so network failures (DNS/TLS/socket) are visible.
    let mut message = err.to_string();
    let mut source = err.source();

    while let Some(cause) = source {
        let cause_msg = cause.to_string();
        if !cause_msg.is_empty() && !message.contains(&cause_msg) {
            message.push_str(": ");
            message.push_str(&cause_msg);
        }
        source = cause.source();
    }

    message
}

fn summarize_response_body(raw: &str) -> String {
    const MAX_CHARS: usize = 500;
    let compact = raw.replace(['\n', '\r'], " ");
    if compact.chars().count() > MAX_CHARS {
        let truncated: String = compact.chars().take(MAX_CHARS).collect();
        format!("{truncated}…")
    } else {
        compact
    }
}

/// Google's standard error envelope: `{"error": {"code", "message", "status"}}`.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Map a non-success HTTP status to the workspace error taxonomy.
pub fn map_status(status: u16, body: &str, url: &str) -> Error {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|env| env.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| summarize_response_body(body));
    let message = format!("{message} ({url})");

    match status {
        401 | 403 => Error::PermissionDenied(message),
        404 => Error::NotFound(message),
        429 => Error::QuotaExceeded(message),
        _ => Error::GcpApi { status, message },
    }
}

/// A list response that may continue on another page.
pub trait Paged {
    fn next_page_token(&self) -> Option<&str>;
}

/// Bearer-token client. Clones share the HTTP pool and the rate limiter.
#[derive(Debug, Clone)]
pub struct GcpClient {
    client: reqwest::Client,
    access_token: String,
    limiter: RateLimiter,
}

impl GcpClient {
    pub fn new(
        access_token: impl Into<String>,
        requests_per_sec: u32,
        request_timeout: Duration,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent("spendscope/0.1")
            .pool_max_idle_per_host(4)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Http(format_reqwest_error(&e)))?;

        Ok(Self {
            client,
            access_token: access_token.into(),
            limiter: RateLimiter::per_second(requests_per_sec),
        })
    }

    /// GET `url` with query parameters and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, Error> {
        self.limiter.acquire(url).await;
        debug!("GET {}", url);

        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Http(format_reqwest_error(&e)))?;

        Self::decode(resp, url).await
    }

    /// POST a JSON body to `url` and decode the JSON response.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, Error> {
        self.limiter.acquire(url).await;
        debug!("POST {}", url);

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Http(format_reqwest_error(&e)))?;

        Self::decode(resp, url).await
    }

    /// Follow `nextPageToken` until exhausted and return every page.
    pub async fn list_all<P: DeserializeOwned + Paged>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<P>, Error> {
        let mut pages = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut params: Vec<(&str, String)> = query.to_vec();
            if let Some(t) = token.take() {
                params.push(("pageToken", t));
            }

            let page: P = self.get_json(url, &params).await?;
            token = page
                .next_page_token()
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            pages.push(page);

            if token.is_none() {
                break;
            }
            if pages.len() >= MAX_PAGES {
                return Err(Error::Other(format!(
                    "pagination exceeded {MAX_PAGES} pages for {url}"
                )));
            }
        }

        debug!("Fetched {} page(s) from {}", pages.len(), url);
        Ok(pages)
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response, url: &str) -> Result<T, Error> {
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Http(format_reqwest_error(&e)))?;

        if !(200..300).contains(&status) {
            return Err(map_status(status, &body, url));
        }

        serde_json::from_str(&body).map_err(Error::Json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_errors_map_to_permission_denied() {
        let body = r#"{"error": {"code": 403, "message": "Compute Engine API has not been used", "status": "PERMISSION_DENIED"}}"#;
        match map_status(403, body, "https://compute.googleapis.com/x") {
            Error::PermissionDenied(msg) => {
                assert!(msg.starts_with("Compute Engine API has not been used"));
                assert!(msg.contains("compute.googleapis.com"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(map_status(401, "", "u"), Error::PermissionDenied(_)));
    }

    #[test]
    fn test_quota_and_not_found() {
        assert!(matches!(map_status(429, "slow down", "u"), Error::QuotaExceeded(_)));
        assert!(matches!(map_status(404, "", "u"), Error::NotFound(_)));
    }

    #[test]
    fn test_other_status_keeps_code_and_truncates_body() {
        let body = "x".repeat(2_000);
        match map_status(503, &body, "u") {
            Error::GcpApi { status, message } => {
                assert_eq!(status, 503);
                assert!(message.chars().count() < 600);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_client_builds_with_token() {
        let client = GcpClient::new("token", 5, Duration::from_secs(10));
        assert!(client.is_ok());
    }
}
