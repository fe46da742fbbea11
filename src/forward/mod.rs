//! Forward module
//!
//! Parses each inbound path into a `(ClientKind, ClientDialect)` pair per
//! the external interface table and hands the parsed request to the
//! dispatch engine.
//!
//! ## Components
//!
//! - `handlers`: Provider-specific request/response handling
//! - `client`: HTTP client utilities with retry logic
//! - `context`: Shared data structures
//! - `error`: Error types
//! - `limits`: Rate limiter

pub mod cancel;
pub mod client;
pub mod context;
pub mod error;
pub mod handlers;
pub mod limits;

use axum::{http::HeaderMap, response::{IntoResponse, Response}, Json};
use serde_json::Value;

use crate::config::{ClientDialect, ClientKind};

#[allow(unused_imports)]
pub use context::{ForwardContext, ForwardPlan, Provider, RetryConfig, TokenUsage, UpstreamResponse, estimate_tokens};
#[allow(unused_imports)]
pub use error::{ForwardError, ForwardResult};
#[allow(unused_imports)]
pub use handlers::{get_handler, ProviderHandler};

/// `POST /claude/*`
pub async fn claude_entry(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    crate::dispatch::handle(ClientKind::Claude, ClientDialect::Claude, headers, payload).await
}

/// `POST /gemini/*`: Gemini clients speak Claude dialect to this proxy.
pub async fn gemini_entry(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    crate::dispatch::handle(ClientKind::Gemini, ClientDialect::Claude, headers, payload).await
}

/// `POST /codex/*/chat/completions`
pub async fn codex_chat_entry(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    crate::dispatch::handle(ClientKind::Codex, ClientDialect::OpenaiChat, headers, payload).await
}

/// `POST /codex/*/responses`
pub async fn codex_responses_entry(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    crate::dispatch::handle(ClientKind::Codex, ClientDialect::OpenaiResponses, headers, payload).await
}

/// `POST /v1/messages` (legacy, unprefixed: claude client kind, claude dialect)
pub async fn legacy_messages(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    crate::dispatch::handle(ClientKind::Claude, ClientDialect::Claude, headers, payload).await
}

pub async fn legacy_chat_completions(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    crate::dispatch::handle(ClientKind::Claude, ClientDialect::OpenaiChat, headers, payload).await
}

pub async fn legacy_responses(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    crate::dispatch::handle(ClientKind::Claude, ClientDialect::OpenaiResponses, headers, payload).await
}

/// `POST /v1/messages/count_tokens`: estimate tokens for a Claude-shaped
/// request body without forwarding it anywhere.
pub async fn count_tokens(Json(payload): Json<Value>) -> impl IntoResponse {
    let mut text = String::new();
    if let Some(system) = payload.get("system").and_then(|v| v.as_str()) {
        text.push_str(system);
    }
    if let Some(messages) = payload.get("messages").and_then(|v| v.as_array()) {
        for message in messages {
            if let Some(content) = message.get("content") {
                match content {
                    Value::String(s) => text.push_str(s),
                    Value::Array(parts) => {
                        for part in parts {
                            if let Some(s) = part.get("text").and_then(|v| v.as_str()) {
                                text.push_str(s);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    Json(serde_json::json!({ "input_tokens": estimate_tokens(&text) }))
}

/// Health check for API endpoints
pub async fn api_health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn count_tokens_walks_system_and_message_parts() {
        let payload = serde_json::json!({
            "system": "be terse",
            "messages": [
                {"role": "user", "content": "hello there"},
                {"role": "assistant", "content": [{"type": "text", "text": "hi"}]}
            ]
        });
        let response = count_tokens(Json(payload)).await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
