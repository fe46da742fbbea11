use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

use crate::{config, db, forward, logger, monitor};

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Deserialize)]
struct SummaryQ {
    range: Option<String>,
}

async fn stats_summary(Query(q): Query<SummaryQ>) -> Json<Value> {
    let range = q.range.unwrap_or_else(|| "daily".to_string());
    let (reqs, tokens, price) = db::summary_for_range(&range);
    Json(json!({
        "range": range,
        "requests": reqs,
        "tokens": tokens,
        "price_usd": price
    }))
}

#[derive(Deserialize)]
struct SeriesQ {
    metric: Option<String>,
    days: Option<i64>,
}

async fn stats_series(Query(q): Query<SeriesQ>) -> Json<Value> {
    let days = q.days.unwrap_or(30);
    if q.metric.as_deref() == Some("price") {
        let s = db::series_price(days);
        return Json(
            json!({"days": s.iter().map(|(d,_)| d).cloned().collect::<Vec<_>>(), "price": s.iter().map(|(_,v)| v).cloned().collect::<Vec<_>>() }),
        );
    }
    let s = db::series_tokens(days);
    Json(
        json!({"days": s.iter().map(|(d,_)| d).cloned().collect::<Vec<_>>(), "tokens": s.iter().map(|(_,v)| v).cloned().collect::<Vec<_>>() }),
    )
}

async fn stats_channels() -> Json<Value> {
    let s = db::channels_breakdown();
    Json(json!({"channels": s}))
}

#[derive(Deserialize)]
struct ModelsQ {
    range: Option<String>,
}

async fn stats_models(Query(q): Query<ModelsQ>) -> Json<Value> {
    let days = match q.range.as_deref() {
        Some("weekly") => 7,
        Some("monthly") => 30,
        _ => 1,
    };
    let s = db::models_cost_since(days);
    Json(json!({"models": s}))
}

#[derive(Deserialize)]
struct LogsQ {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn stats_logs(Query(q): Query<LogsQ>) -> Json<Value> {
    let limit = q.limit.unwrap_or(50);
    let offset = q.offset.unwrap_or(0);
    let logs = db::recent_logs(limit, offset);
    let total = db::logs_count();
    Json(json!({
        "logs": logs,
        "total": total,
        "limit": limit,
        "offset": offset
    }))
}

/// Live endpoint/active-request state for the dashboard, sourced from the
/// monitor (component G) rather than the database.
async fn stats_endpoints() -> Json<Value> {
    let cfg = config::load();
    let endpoints: Vec<Value> = cfg
        .endpoints
        .iter()
        .map(|e| {
            let metric = monitor::metric_for(&e.name);
            json!({
                "name": e.name,
                "client_kind": e.client_kind.as_str(),
                "status": format!("{:?}", e.status).to_lowercase(),
                "health": format!("{:?}", monitor::health_status(&e.name)).to_lowercase(),
                "active_count": metric.active_count,
                "avg_response_time_ms": metric.avg_response_time,
                "success_rate": metric.success_rate,
                "last_error": metric.last_error,
            })
        })
        .collect();
    Json(json!({ "endpoints": endpoints }))
}

async fn get_config() -> Json<config::Settings> {
    Json((*config::load()).clone())
}

async fn put_config(Json(body): Json<config::Settings>) -> impl IntoResponse {
    match config::update(body) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    }
}

async fn export_backup() -> Json<Value> {
    let cfg = config::load();
    let daily = db::summary_for_range("daily");
    let weekly = db::summary_for_range("weekly");
    let monthly = db::summary_for_range("monthly");
    Json(json!({
        "settings": cfg,
        "usage": {
            "daily": { "requests": daily.0, "tokens": daily.1, "price_usd": daily.2 },
            "weekly": { "requests": weekly.0, "tokens": weekly.1, "price_usd": weekly.2 },
            "monthly": { "requests": monthly.0, "tokens": monthly.1, "price_usd": monthly.2 },
        }
    }))
}

async fn clear_all_data() -> impl IntoResponse {
    match clear_all_data_inner() {
        Ok(payload) => Json(payload).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err})),
        )
            .into_response(),
    }
}

fn clear_all_data_inner() -> Result<Value, String> {
    db::clear_all_data()?;
    let logs_deleted = logger::clear_all_logs()?;
    config::reset()?;
    Ok(json!({
        "ok": true,
        "logs_deleted": logs_deleted,
    }))
}

#[derive(Deserialize)]
struct GlobalLogsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    level: Option<String>,
    source: Option<String>,
    start_time: Option<i64>,
    end_time: Option<i64>,
}

async fn get_global_logs(Query(q): Query<GlobalLogsQuery>) -> Json<Value> {
    let query = logger::LogQuery {
        limit: q.limit,
        offset: q.offset,
        level: q.level.as_ref().and_then(|l| logger::LogLevel::from_str(l)),
        source: q.source,
        start_time: q.start_time,
        end_time: q.end_time,
    };
    let logs = logger::query_logs(&query);
    let total = logger::logs_count(&query);
    Json(json!({
        "logs": logs,
        "total": total,
        "limit": q.limit.unwrap_or(100),
        "offset": q.offset.unwrap_or(0)
    }))
}

async fn get_global_logs_count(Query(q): Query<GlobalLogsQuery>) -> Json<Value> {
    let query = logger::LogQuery {
        limit: None,
        offset: None,
        level: q.level.as_ref().and_then(|l| logger::LogLevel::from_str(l)),
        source: q.source,
        start_time: q.start_time,
        end_time: q.end_time,
    };
    let count = logger::logs_count(&query);
    Json(json!({ "count": count }))
}

async fn delete_global_log(Path(id): Path<i64>) -> impl IntoResponse {
    match logger::delete_log(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (StatusCode::NOT_FOUND, Json(json!({"error": err}))).into_response(),
    }
}

async fn delete_global_logs_batch(Json(req): Json<logger::DeleteLogsRequest>) -> impl IntoResponse {
    match logger::delete_logs(&req) {
        Ok(count) => Json(json!({ "deleted": count })).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(json!({"error": err}))).into_response(),
    }
}

async fn clear_global_logs() -> impl IntoResponse {
    match logger::clear_all_logs() {
        Ok(count) => Json(json!({ "deleted": count })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err})),
        )
            .into_response(),
    }
}

pub fn app() -> Router {
    let cors = CorsLayer::permissive();
    Router::new()
        .route("/health", get(health))
        .route("/v1/health", get(forward::api_health))
        // ============================================
        // Dispatch entry points (§6 external interfaces)
        // ============================================
        .route("/claude/*path", post(forward::claude_entry))
        .route("/gemini/*path", post(forward::gemini_entry))
        .route("/codex/*path", post(codex_dispatch))
        .route("/v1/messages", post(forward::legacy_messages))
        .route("/v1/messages/count_tokens", post(forward::count_tokens))
        .route("/v1/chat/completions", post(forward::legacy_chat_completions))
        .route("/v1/responses", post(forward::legacy_responses))
        // ============================================
        // Stats & Analytics API
        // ============================================
        .route("/api/stats/summary", get(stats_summary))
        .route("/api/stats/series", get(stats_series))
        .route("/api/stats/channels", get(stats_channels))
        .route("/api/stats/models", get(stats_models))
        .route("/api/stats/logs", get(stats_logs))
        .route("/api/stats/endpoints", get(stats_endpoints))
        // ============================================
        // Config API
        // ============================================
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/export/backup", get(export_backup))
        .route("/api/data/clear", post(clear_all_data))
        // ============================================
        // Global Logs API
        // ============================================
        .route("/api/logs", get(get_global_logs).delete(clear_global_logs))
        .route("/api/logs/count", get(get_global_logs_count))
        .route("/api/logs/:id", axum::routing::delete(delete_global_log))
        .route("/api/logs/delete", post(delete_global_logs_batch))
        .layer(cors)
}

/// `/codex/*path` dispatches to chat-completions or responses dialect based
/// on the path tail, per the external interface table.
async fn codex_dispatch(
    Path(path): Path<String>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    if path.ends_with("/responses") {
        forward::codex_responses_entry(headers, Json(payload)).await
    } else {
        forward::codex_chat_entry(headers, Json(payload)).await
    }
}

pub async fn serve() {
    let app = app();
    let port = config::load().port;
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    logger::info("server", &format!("listening on {addr}"));
    axum::serve(listener, app).await.unwrap();
}

pub fn spawn() {
    tokio::spawn(async move { serve().await });
}

#[cfg(test)]
mod tests {
    use super::*;
    #[tokio::test]
    async fn health_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = app();
        let h = tokio::spawn(async move { axum::serve(listener, a).await.unwrap() });
        let url = format!("http://{}", addr);
        let r = reqwest::get(format!("{}/health", url)).await.unwrap();
        let s = r.json::<serde_json::Value>().await.unwrap();
        assert_eq!(s["status"], "ok");
        drop(h);
    }
}
