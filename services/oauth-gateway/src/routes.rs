//! HTTP surface over the token lifecycle
//!
//! Endpoints:
//! - GET /install?session=ID: redirect to the provider's authorize page
//! - GET /oauth-callback?code&state: exchange the code for the session in `state`
//! - GET /sessions/{id}: authorization status, refreshing if needed
//! - GET /health: liveness and store sizes
//! - GET /metrics: Prometheus exposition
//!
//! Tokens never appear in responses. Session ids are opaque to the token
//! crates; here they are restricted to URL-safe characters so they can be
//! echoed into redirects without encoding.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use oauth_exchange::ExchangeError;
use reqwest::Url;
use serde::Deserialize;
use token_lifecycle::{TokenError, TokenLifecycleManager};
use tracing::{info, warn};

const MAX_SESSION_ID_LEN: usize = 128;

/// Inputs for building the authorize redirect.
pub struct AuthorizeSettings {
    pub authorize_url: Url,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: String,
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TokenLifecycleManager>,
    pub authorize: Arc<AuthorizeSettings>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the axum router with all routes and shared state.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/install", get(install))
        .route("/oauth-callback", get(oauth_callback))
        .route("/sessions/{id}", get(session_status))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route_layer(axum::middleware::from_fn(crate::metrics::track_requests))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn invalid_session() -> Response {
    json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({
            "error": "session id must be 1-128 characters of [A-Za-z0-9_-]"
        }),
    )
}

fn reauthorize(identity: &str) -> Response {
    Redirect::to(&format!("/install?session={identity}")).into_response()
}

/// Map a failed exchange to a user-facing response.
fn exchange_failure(err: &ExchangeError, transport_status: StatusCode) -> Response {
    match err {
        ExchangeError::Rejected { code, .. } => json_response(
            StatusCode::BAD_GATEWAY,
            serde_json::json!({
                "error": "authorization failed, please reinstall the app",
                "provider_error": code,
            }),
        ),
        ExchangeError::Transport(_) => json_response(
            transport_status,
            serde_json::json!({
                "error": "token endpoint unavailable, try again shortly"
            }),
        ),
    }
}

#[derive(Deserialize)]
struct InstallParams {
    session: String,
}

/// GET /install: send the user to the provider with their session as `state`.
async fn install(
    State(state): State<AppState>,
    Query(params): Query<InstallParams>,
) -> Response {
    if !valid_session_id(&params.session) {
        return invalid_session();
    }
    let settings = &state.authorize;
    let url = oauth_exchange::authorization_url(
        &settings.authorize_url,
        &settings.client_id,
        &settings.redirect_uri,
        &settings.scopes,
        &params.session,
    );
    Redirect::to(url.as_str()).into_response()
}

#[derive(Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /oauth-callback: provider redirect after the user approves (or not).
async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        warn!(error = %error, "provider returned an authorization error");
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": "authorization was not granted",
                "provider_error": error,
                "provider_error_description": params.error_description.unwrap_or_default(),
            }),
        );
    }

    let (Some(code), Some(identity)) = (params.code, params.state) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "callback requires code and state" }),
        );
    };
    if !valid_session_id(&identity) {
        return invalid_session();
    }

    match state
        .manager
        .exchange_authorization_code(&identity, &code)
        .await
    {
        Ok(_) => {
            info!(identity = %identity, "session authorized");
            Redirect::to(&format!("/sessions/{identity}")).into_response()
        }
        Err(e) => exchange_failure(&e, StatusCode::BAD_GATEWAY),
    }
}

/// GET /sessions/{id}: report whether a usable access token is available.
async fn session_status(State(state): State<AppState>, Path(identity): Path<String>) -> Response {
    if !valid_session_id(&identity) {
        return invalid_session();
    }
    if !state.manager.is_authorized(&identity).await {
        return reauthorize(&identity);
    }

    match state.manager.get_access_token(&identity).await {
        Ok(_) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "session": identity,
                "authorized": true,
                "token_ready": true,
            }),
        ),
        Err(TokenError::NotAuthorized) => reauthorize(&identity),
        Err(TokenError::RefreshFailed(e)) if e.invalidates_refresh_token() => reauthorize(&identity),
        Err(TokenError::RefreshFailed(e)) => exchange_failure(&e, StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// GET /health: liveness with store sizes (never token values).
async fn health(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "authorized_sessions": state.manager.refresh_tokens().len().await,
            "cached_access_tokens": state.manager.access_tokens().len().await,
        }),
    )
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
