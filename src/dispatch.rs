//! Dispatch engine (component K): turns one inbound client request into a
//! served response by integrating the cache, rate limiter, session
//! affinity, router, and per-dialect handlers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde_json::Value;

use crate::config::{self, ClientDialect, ClientKind, Endpoint, EndpointStatus, UpstreamDialect};
use crate::forward::cancel;
use crate::forward::context::{AuthMode, ForwardContext, ModelInfo, Provider, RequestMeta, UpstreamInfo};
use crate::forward::error::{ForwardError, ForwardResult};
use crate::forward::handlers::{self, ProviderHandler};
use crate::forward::limits;
use crate::{cache, monitor, quota, router};

const TEST_ENDPOINT_HEADER: &str = "x-ccnexus-endpoint";
const SESSION_HEADER: &str = "x-ccnexus-session-id";
const REQUEST_ID_HEADER: &str = "x-request-id";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract the session id per §4.1 step 2: the session header, else the
/// request-id header, else a hash of `(clientIP, userAgent)`.
fn extract_session_id(headers: &HeaderMap) -> String {
    if let Some(sid) = header_str(headers, SESSION_HEADER) {
        if !sid.is_empty() {
            return sid.to_string();
        }
    }
    if let Some(rid) = header_str(headers, REQUEST_ID_HEADER) {
        if !rid.is_empty() {
            return rid.to_string();
        }
    }
    let ip = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim())
        .or_else(|| header_str(headers, "x-real-ip"))
        .unwrap_or("unknown");
    let ua = header_str(headers, "user-agent").unwrap_or("unknown");

    let mut hasher = DefaultHasher::new();
    ip.hash(&mut hasher);
    ua.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn request_model(payload: &Value) -> String {
    payload
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn is_streaming_request(payload: &Value) -> bool {
    payload.get("stream").and_then(|v| v.as_bool()).unwrap_or(false)
}

fn api_style_for(upstream_dialect: UpstreamDialect) -> Option<String> {
    match upstream_dialect {
        UpstreamDialect::Claude => Some("anthropic".to_string()),
        UpstreamDialect::OpenaiChat | UpstreamDialect::OpenaiResponses => Some("openai".to_string()),
        UpstreamDialect::Gemini => Some("gemini".to_string()),
    }
}

fn client_provider(client_dialect: ClientDialect) -> Provider {
    match client_dialect {
        ClientDialect::Claude => Provider::Anthropic,
        ClientDialect::OpenaiChat | ClientDialect::OpenaiResponses => Provider::OpenAI,
    }
}

fn build_context(
    endpoint: &Endpoint,
    client_dialect: ClientDialect,
    request_model: &str,
    is_streaming: bool,
) -> ForwardContext {
    ForwardContext {
        auth_mode: AuthMode::UseConfiguredKey,
        model: ModelInfo {
            id: request_model.to_string(),
            display_name: request_model.to_string(),
            provider: client_provider(client_dialect),
            upstream_id: endpoint.name.clone(),
            upstream_model_id: endpoint.model.clone(),
            price_prompt_per_1k: endpoint.cost_per_input_token / 1000.0,
            price_completion_per_1k: endpoint.cost_per_output_token / 1000.0,
        },
        upstream: UpstreamInfo {
            id: endpoint.name.clone(),
            endpoints: vec![endpoint.api_url.clone()],
            api_style: api_style_for(endpoint.upstream_dialect),
            api_key: endpoint.api_key.clone(),
        },
        gemini_api_version: None,
        meta: RequestMeta { channel: client_dialect_label(client_dialect).to_string(), tool: "dispatch".to_string() },
        is_streaming,
        retry_max_attempts_override: None,
    }
}

fn client_dialect_label(d: ClientDialect) -> &'static str {
    match d {
        ClientDialect::Claude => "claude",
        ClientDialect::OpenaiChat => "openai-chat",
        ClientDialect::OpenaiResponses => "openai-responses",
    }
}

/// True for statuses the error-handling taxonomy (§7) classifies as
/// transient: connection failure, 5xx/408/429, or a timeout.
fn is_retryable(err: &ForwardError) -> bool {
    !matches!(
        err,
        ForwardError::Unauthorized(_) | ForwardError::InvalidRequest(_) | ForwardError::ModelNotFound(_)
    )
}

/// Rotation with in-flight wait (§4.1, scenario S4): before advancing past a
/// failed endpoint, give its still-running requests up to 500ms, polled every
/// 50ms, to drain so a rotated-away endpoint doesn't keep climbing its own
/// concurrency counter while nothing routes to it anymore.
async fn wait_for_drain(endpoint_name: &str) {
    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    const MAX_WAIT: Duration = Duration::from_millis(500);

    let deadline = tokio::time::Instant::now() + MAX_WAIT;
    while monitor::active_count(endpoint_name) > 0 {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn mark_available_if_needed(endpoint: &Endpoint) {
    if endpoint.status == EndpointStatus::Available {
        return;
    }
    let mut cfg = (*config::load()).clone();
    if let Some(ep) = cfg.endpoints.iter_mut().find(|e| e.name == endpoint.name) {
        if ep.status != EndpointStatus::Available {
            ep.status = EndpointStatus::Available;
            let _ = config::update(cfg);
        }
    }
}

async fn call_handler_nonstream(
    endpoint: &Endpoint,
    client_dialect: ClientDialect,
    ctx: ForwardContext,
    payload: Value,
) -> ForwardResult<Value> {
    if client_dialect == ClientDialect::OpenaiResponses {
        let handler = handlers::openai::OpenAIHandler;
        let response = handler.handle_responses_request(ctx, payload).await?;
        return Ok(response.body);
    }
    let handler = get_handler_for(endpoint, client_dialect);
    let response = handler.handle_request(ctx, payload).await?;
    Ok(response.body)
}

async fn call_handler_stream(
    endpoint: &Endpoint,
    client_dialect: ClientDialect,
    ctx: ForwardContext,
    payload: Value,
) -> ForwardResult<Response> {
    if client_dialect == ClientDialect::OpenaiResponses {
        let handler = handlers::openai::OpenAIHandler;
        return handler.handle_responses_stream(ctx, payload).await;
    }
    let handler = get_handler_for(endpoint, client_dialect);
    handler.handle_stream(ctx, payload).await
}

fn get_handler_for(_endpoint: &Endpoint, client_dialect: ClientDialect) -> ProviderHandler {
    handlers::get_handler(client_provider(client_dialect))
}

/// Bind a handler's streaming response to its endpoint's cancellation signal
/// (§4.5): stop forwarding bytes to the client, without erroring, the moment
/// a manual switch moves this client kind off `endpoint_name` mid-stream.
fn bind_stream_to_endpoint(response: Response, endpoint_name: &str) -> Response {
    let mut cancel_rx = cancel::cancel_receiver(endpoint_name);
    let (parts, body) = response.into_parts();
    let guarded = body
        .into_data_stream()
        .take_while(move |_| futures_util::future::ready(!*cancel_rx.borrow_and_update()));
    Response::from_parts(parts, Body::from_stream(guarded))
}

fn pick_test_endpoint(client_kind: ClientKind, name: &str) -> Option<Endpoint> {
    config::load()
        .endpoints
        .iter()
        .find(|e| e.client_kind == client_kind && e.name == name)
        .cloned()
}

fn eligible_count(client_kind: ClientKind) -> usize {
    config::load()
        .endpoints
        .iter()
        .filter(|e| e.client_kind == client_kind)
        .filter(|e| matches!(e.status, EndpointStatus::Available | EndpointStatus::Untested))
        .count()
        .max(1)
}

/// `handle(request)`: drive one client request to completion per §4.1.
pub async fn handle(
    client_kind: ClientKind,
    client_dialect: ClientDialect,
    headers: HeaderMap,
    payload: Value,
) -> Response {
    let session_id = extract_session_id(&headers);
    let request_model = request_model(&payload);
    let is_streaming = is_streaming_request(&payload);
    let test_pin = header_str(&headers, TEST_ENDPOINT_HEADER).map(|s| s.to_string());

    if !is_streaming && config::load().cache.enabled {
        let key = cache::fingerprint(&payload);
        if let Some(entry) = cache::get(&key) {
            let mut response = Json(entry.body).into_response();
            response.headers_mut().insert(
                "x-ccnexus-cache",
                axum::http::HeaderValue::from_static("HIT"),
            );
            return response;
        }
    }

    let max_retries = if test_pin.is_some() { 3 } else { 2 * eligible_count(client_kind) as u32 };

    let mut last_endpoint_name: Option<String> = None;
    let mut endpoint_attempts: u32 = 0;
    let mut last_error = String::from("no endpoints available");

    for attempt in 0..max_retries {
        let endpoint = match &test_pin {
            Some(name) => pick_test_endpoint(client_kind, name),
            None => router::select_endpoint(client_kind, &request_model, Some(&session_id)),
        };
        let Some(endpoint) = endpoint else {
            last_error = "no eligible endpoint".to_string();
            break;
        };

        if last_endpoint_name.as_deref() != Some(endpoint.name.as_str()) {
            endpoint_attempts = 0;
            last_endpoint_name = Some(endpoint.name.clone());
        }
        endpoint_attempts += 1;

        // §4.1 step 4: the rate limiter only applies when there is no
        // test-endpoint override; a pinned request bypasses admission control.
        let guard = if test_pin.is_some() {
            None
        } else {
            match limits::check_and_acquire(Some(session_id.clone()), Some(&endpoint.name)).await {
                Ok(g) => g,
                Err(e) => return e.into_response(),
            }
        };

        let request_id = format!("{}-{attempt}", session_id);
        monitor::start_request(&request_id, &endpoint.name, client_kind.as_str(), &request_model);

        let ctx = build_context(&endpoint, client_dialect, &request_model, is_streaming);

        if is_streaming {
            match call_handler_stream(&endpoint, client_dialect, ctx, payload.clone()).await {
                Ok(response) => {
                    monitor::complete_request(&request_id, true, None);
                    mark_available_if_needed(&endpoint);
                    drop(guard);
                    return bind_stream_to_endpoint(response, &endpoint.name);
                }
                Err(err) => {
                    monitor::complete_request(&request_id, false, Some(&err.to_string()));
                    drop(guard);
                    if !is_retryable(&err) {
                        return err.into_response();
                    }
                    last_error = err.to_string();
                    if endpoint_attempts >= 2 {
                        router::downgrade_if_untested(&endpoint.name);
                        wait_for_drain(&endpoint.name).await;
                    }
                    continue;
                }
            }
        }

        match call_handler_nonstream(&endpoint, client_dialect, ctx, payload.clone()).await {
            Ok(body) => {
                monitor::complete_request(&request_id, true, None);
                mark_available_if_needed(&endpoint);

                let prompt_tokens = body
                    .get("usage")
                    .and_then(|u| u.get("prompt_tokens").or_else(|| u.get("input_tokens")))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                let completion_tokens = body
                    .get("usage")
                    .and_then(|u| u.get("completion_tokens").or_else(|| u.get("output_tokens")))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                quota::record_usage(
                    &endpoint.name,
                    client_kind.as_str(),
                    endpoint.quota_reset_cycle,
                    endpoint.quota_limit,
                    prompt_tokens + completion_tokens,
                );

                if config::load().cache.enabled {
                    let key = cache::fingerprint(&payload);
                    cache::put(key, body.clone(), Default::default());
                }

                drop(guard);
                return Json(body).into_response();
            }
            Err(err) => {
                monitor::complete_request(&request_id, false, Some(&err.to_string()));
                drop(guard);
                if !is_retryable(&err) {
                    return err.into_response();
                }
                last_error = err.to_string();
                if endpoint_attempts >= 2 {
                    router::downgrade_if_untested(&endpoint.name);
                    wait_for_drain(&endpoint.name).await;
                }
            }
        }

        let delay = 50u64 * (attempt as u64 + 1);
        tokio::time::sleep(Duration::from_millis(delay.min(500))).await;
    }

    let truncated: String = last_error.chars().take(500).collect();
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": { "type": "exhausted", "message": truncated } })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_falls_back_to_ip_ua_hash() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.5".parse().unwrap());
        headers.insert("user-agent", "test-agent".parse().unwrap());
        let id = extract_session_id(&headers);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_header_takes_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ccnexus-session-id", "explicit-session".parse().unwrap());
        assert_eq!(extract_session_id(&headers), "explicit-session");
    }

    #[test]
    fn is_retryable_excludes_client_errors() {
        assert!(!is_retryable(&ForwardError::Unauthorized("no".into())));
        assert!(!is_retryable(&ForwardError::InvalidRequest("bad".into())));
        assert!(is_retryable(&ForwardError::RequestFailed("502".into())));
        assert!(is_retryable(&ForwardError::Timeout("slow".into())));
    }
}
