use crate::error::{ProxyError, Result};
use crate::upstream::rate_limit::parse_retry_delay;
use crate::upstream::sse::{decode_payload, decode_stream, ChunkStream};
use crate::upstream::types::{GenerateContentResponse, UpstreamRequest};

use reqwest::StatusCode;
use std::sync::Arc;

pub const USER_AGENT: &str = "antigravity/1.11.5 windows/amd64";
pub const API_CLIENT: &str = "google-cloud-sdk vscode_cloudshelleditor/0.1";
pub const CLIENT_METADATA: &str =
    r#"{"ideType":"IDE_UNSPECIFIED","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#;

const GENERATE_PATH: &str = "/v1internal:generateContent";
const STREAM_PATH: &str = "/v1internal:streamGenerateContent?alt=sse";

/// HTTP client for the Cloud Code endpoints.
///
/// Each call walks the configured endpoint list in order and moves on only
/// when an endpoint answers 429 or cannot be reached.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    endpoints: Arc<[String]>,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, endpoints: Vec<String>) -> Self {
        Self {
            http,
            endpoints: endpoints.into(),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Buffered `generateContent` call.
    pub async fn generate(
        &self,
        access_token: &str,
        body: &UpstreamRequest,
    ) -> Result<GenerateContentResponse> {
        let response = self.post(GENERATE_PATH, access_token, body, false).await?;
        let text = response.text().await?;
        decode_payload(&text).ok_or_else(|| {
            ProxyError::other(format!(
                "Unparseable upstream response: {}",
                truncate(&text, 300)
            ))
        })
    }

    /// `streamGenerateContent` call; chunks are decoded lazily as they arrive.
    pub async fn stream(&self, access_token: &str, body: &UpstreamRequest) -> Result<ChunkStream> {
        let response = self.post(STREAM_PATH, access_token, body, true).await?;
        Ok(decode_stream(response.bytes_stream()))
    }

    async fn post(
        &self,
        path: &str,
        access_token: &str,
        body: &UpstreamRequest,
        streaming: bool,
    ) -> Result<reqwest::Response> {
        let mut last_error: Option<ProxyError> = None;

        for (i, endpoint) in self.endpoints.iter().enumerate() {
            let is_last = i + 1 == self.endpoints.len();
            let url = format!("{}{}", endpoint.trim_end_matches('/'), path);

            let mut request = self
                .http
                .post(&url)
                .bearer_auth(access_token)
                .header("Content-Type", "application/json")
                .header("User-Agent", USER_AGENT)
                .header("X-Goog-Api-Client", API_CLIENT)
                .header("Client-Metadata", CLIENT_METADATA);
            if streaming {
                request = request.header("Accept", "text/event-stream");
            }

            tracing::debug!(url = %url, model = %body.model, "Upstream request");

            let response = match request.json(body).send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Upstream endpoint unreachable");
                    // An earlier 429 still decides the outcome so the caller rotates accounts.
                    if !matches!(last_error, Some(ProxyError::RateLimited { .. })) {
                        last_error = Some(e.into());
                    }
                    continue;
                }
            };

            if response.status() == StatusCode::TOO_MANY_REQUESTS && !is_last {
                tracing::info!(endpoint = %endpoint, "Endpoint rate limited, trying next");
                last_error = check_status(response).await.err();
                continue;
            }

            return check_status(response).await;
        }

        Err(last_error.unwrap_or(ProxyError::RateLimited {
            retry_after: None,
            body: String::new(),
        }))
    }
}

/// Map a non-2xx response onto the error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProxyError::RateLimited {
            retry_after: parse_retry_delay(&body),
            body,
        });
    }

    tracing::warn!(status = status.as_u16(), body = %truncate(&body, 300), "Upstream error");
    Err(ProxyError::Upstream {
        status: status.as_u16(),
        body,
    })
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
