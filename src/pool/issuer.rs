//! Access-token refresh against the identity provider.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::cache::Clock;
use crate::error::{ProxyError, Result};

/// Result of a refresh. `refresh_token` is only set when the provider rotated it.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Unix milliseconds.
    pub expires_at: i64,
    pub refresh_token: Option<String>,
}

#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Google OAuth `refresh_token` grant.
#[derive(Debug, Clone)]
pub struct GoogleOAuthIssuer {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    clock: Arc<dyn Clock>,
}

impl GoogleOAuthIssuer {
    pub fn new(
        http: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: token_url.into(),
            clock,
        }
    }
}

#[async_trait]
impl CredentialIssuer for GoogleOAuthIssuer {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken> {
        if refresh_token.is_empty() {
            return Err(ProxyError::refresh("account has no refresh token"));
        }

        let form = [
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProxyError::refresh(format!("token request failed: {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<TokenErrorResponse>(&body) {
                warn!(error = %error.error, description = ?error.error_description, "Token refresh rejected");
                return Err(ProxyError::refresh(
                    error.error_description.unwrap_or(error.error),
                ));
            }
            return Err(ProxyError::refresh(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProxyError::refresh(format!("unparseable token response: {e}")))?;

        debug!("Access token refreshed");
        Ok(RefreshedToken {
            access_token: token.access_token,
            expires_at: self.clock.now_ms() + token.expires_in * 1000,
            refresh_token: token.refresh_token,
        })
    }
}
