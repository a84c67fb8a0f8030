use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::logging::SharedLogger;
use crate::models::{self, ModelResolver};
use crate::orchestrator::Orchestrator;
use crate::pool::{CredentialIssuer, CredentialPool, TokenStore};
use crate::proxy::{self, Gateway, GatewayReply, SseStream};
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest};
use crate::translate::openai_types::{ChatCompletionRequest, ChatErrorResponse};
use crate::upstream::UpstreamClient;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub logger: SharedLogger,
    /// Key inbound callers must present; `None` disables the check.
    pub api_key: Option<String>,
}

impl AppState {
    /// Wire the gateway from configuration and the two account collaborators.
    pub fn from_config(
        config: &ProxyConfig,
        http: reqwest::Client,
        store: Arc<dyn TokenStore>,
        issuer: Arc<dyn CredentialIssuer>,
        logger: SharedLogger,
        api_key: Option<String>,
    ) -> Self {
        let settings = config.pool.settings();
        let default_delay = settings.default_rate_limit;
        let pool = CredentialPool::new(store, issuer, settings);
        let orchestrator = Orchestrator::new(Arc::new(pool), logger.clone(), default_delay);
        let gateway = Gateway::new(
            ModelResolver::new(config.models.clone()),
            UpstreamClient::new(http, config.upstream.endpoints.clone()),
            orchestrator,
            logger.clone(),
        );
        Self {
            gateway,
            logger,
            api_key,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/models", get(handle_models))
        .route("/v1/models/:id", get(handle_model))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn json_error<T: Serialize>(code: u16, body: T) -> Response {
    (status(code), Json(body)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn api_key_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

/// Whether the caller presented the configured key (via either header).
fn is_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.api_key.as_deref() else {
        return true;
    };
    bearer_token(headers) == Some(expected) || api_key_header(headers) == Some(expected)
}

fn sse_response(events: SseStream) -> Response {
    let stream = events.map(|e| -> std::result::Result<Event, Infallible> {
        let event = Event::default().data(e.data);
        Ok(match e.event {
            Some(name) => event.event(name),
            None => event,
        })
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_authorized(&state, &headers) {
        state.logger.warn("server", "Rejected OpenAI request: bad API key");
        return json_error(401, ChatErrorResponse::from(&ProxyError::Unauthorized));
    }

    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .error("server", format!("Failed to parse request: {}", e));
            return json_error(
                400,
                ChatErrorResponse::new("invalid_request_error", format!("Invalid request body: {}", e)),
            );
        }
    };

    match state.gateway.openai(&req).await {
        Ok(GatewayReply::Complete(resp)) => Json(resp).into_response(),
        Ok(GatewayReply::Stream(events)) => sse_response(events),
        Err(e) => {
            let (code, body) = proxy::openai_error(&state.logger, &e);
            json_error(code, body)
        }
    }
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_authorized(&state, &headers) {
        state
            .logger
            .warn("server", "Rejected Anthropic request: bad API key");
        return json_error(401, ErrorResponse::from(&ProxyError::Unauthorized));
    }

    let req: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .error("server", format!("Failed to parse request: {}", e));
            return json_error(
                400,
                ErrorResponse::invalid_request(format!("Invalid request body: {}", e)),
            );
        }
    };

    match state.gateway.anthropic(&req).await {
        Ok(GatewayReply::Complete(resp)) => Json(resp).into_response(),
        Ok(GatewayReply::Stream(events)) => sse_response(events),
        Err(e) => {
            let (code, body) = proxy::anthropic_error(&state.logger, &e);
            json_error(code, body)
        }
    }
}

fn wants_anthropic_shape(headers: &HeaderMap) -> bool {
    headers.contains_key("anthropic-version")
}

async fn handle_models(headers: HeaderMap) -> Json<serde_json::Value> {
    if wants_anthropic_shape(&headers) {
        Json(models::anthropic_model_list())
    } else {
        Json(models::openai_model_list())
    }
}

async fn handle_model(Path(id): Path<String>, headers: HeaderMap) -> Response {
    if wants_anthropic_shape(&headers) {
        return match models::anthropic_model(&id) {
            Some(model) => Json(model).into_response(),
            None => json_error(404, ErrorResponse::not_found(format!("model: {}", id))),
        };
    }
    match models::openai_model(&id) {
        Some(model) => Json(model).into_response(),
        None => json_error(
            404,
            ChatErrorResponse::from(&ProxyError::ModelNotFound { model: id }),
        ),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let accounts = state.gateway.orchestrator().pool_size().await.ok();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "accounts": accounts,
    }))
}
