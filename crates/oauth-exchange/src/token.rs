//! Token endpoint round-trip
//!
//! Both grants POST a form body to the token endpoint and decode the same
//! JSON response. Outcomes are mapped as:
//! - 2xx with a decodable body → `TokenExchangeResponse`
//! - non-2xx with an OAuth error body → `ExchangeError::Rejected`
//! - anything else (connect error, timeout, garbage body) → `ExchangeError::Transport`

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ExchangeError, Result};
use crate::grant::TokenExchangeRequest;

/// Successful token endpoint response, shared by both grants.
///
/// `refresh_token` may be absent on a refresh response (the provider keeps
/// the old one valid) and on resubmitted code exchanges.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TokenExchangeResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

impl fmt::Debug for TokenExchangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenExchangeResponse")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Error body shapes seen from token endpoints: the RFC 6749 `error` /
/// `error_description` pair, or a provider-specific `status` / `message`.
#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: Option<String>,
    error_description: Option<String>,
    status: Option<String>,
    message: Option<String>,
}

impl ProviderErrorBody {
    fn into_rejection(self) -> Option<ExchangeError> {
        let code = self.error.or(self.status)?;
        let description = self
            .error_description
            .or(self.message)
            .unwrap_or_default();
        Some(ExchangeError::Rejected { code, description })
    }
}

/// Performs a single grant exchange against the provider.
///
/// Uses `Pin<Box<dyn Future>>` so the lifecycle manager can hold an
/// `Arc<dyn TokenExchangeClient>` and tests can swap in a scripted fake.
pub trait TokenExchangeClient: Send + Sync {
    fn exchange(
        &self,
        request: TokenExchangeRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TokenExchangeResponse>> + Send + '_>>;
}

/// reqwest-backed client for a real token endpoint.
#[derive(Debug, Clone)]
pub struct HttpExchangeClient {
    http: reqwest::Client,
    token_url: String,
}

impl HttpExchangeClient {
    /// Build a client whose every request is bounded by `timeout`.
    pub fn new(token_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Transport(format!("building HTTP client: {e}")))?;
        Ok(Self::with_client(http, token_url))
    }

    /// Wrap an existing `reqwest::Client`. The caller owns the timeout policy.
    pub fn with_client(http: reqwest::Client, token_url: impl Into<String>) -> Self {
        Self {
            http,
            token_url: token_url.into(),
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    async fn post_grant(&self, request: &TokenExchangeRequest) -> Result<TokenExchangeResponse> {
        let grant_type = request.grant_type();
        debug!(grant_type, token_url = %self.token_url, "posting token request");

        let response = self
            .http
            .post(&self.token_url)
            .form(&request.form_fields())
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(format!("{grant_type} request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(format!("reading {grant_type} response: {e}")))?;

        if !status.is_success() {
            return match serde_json::from_str::<ProviderErrorBody>(&body)
                .ok()
                .and_then(ProviderErrorBody::into_rejection)
            {
                Some(rejection) => {
                    warn!(grant_type, %status, error = %rejection, "token endpoint rejected grant");
                    Err(rejection)
                }
                None => Err(ExchangeError::Transport(format!(
                    "token endpoint returned {status}: {body}"
                ))),
            };
        }

        serde_json::from_str::<TokenExchangeResponse>(&body)
            .map_err(|e| ExchangeError::Transport(format!("invalid {grant_type} response: {e}")))
    }
}

impl TokenExchangeClient for HttpExchangeClient {
    fn exchange(
        &self,
        request: TokenExchangeRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TokenExchangeResponse>> + Send + '_>> {
        Box::pin(async move { self.post_grant(&request).await })
    }
}
