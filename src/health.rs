//! Periodic health prober (component L): sends a minimal dialect-aware
//! request to every non-disabled endpoint, classifies the result, and
//! drives endpoint status transitions + cooldown-gated alerts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::{self, Endpoint, EndpointStatus, UpstreamDialect};
use crate::monitor;

const PROBE_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    AuthFailed,
    Other,
}

struct ProberState {
    consecutive_failures: HashMap<String, u32>,
    last_alert: HashMap<String, Instant>,
}

static STATE: Lazy<Mutex<ProberState>> = Lazy::new(|| {
    Mutex::new(ProberState {
        consecutive_failures: HashMap::new(),
        last_alert: HashMap::new(),
    })
});

fn minimal_probe_body(endpoint: &Endpoint) -> Value {
    match endpoint.upstream_dialect {
        UpstreamDialect::Claude => json!({
            "model": endpoint.model.clone().unwrap_or_else(|| "claude-3-haiku-20240307".to_string()),
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "Hi"}]
        }),
        UpstreamDialect::OpenaiChat => json!({
            "model": endpoint.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "Hi"}]
        }),
        UpstreamDialect::OpenaiResponses => json!({
            "model": endpoint.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
            "max_output_tokens": 1,
            "input": [{"role": "user", "content": "Hi"}]
        }),
        UpstreamDialect::Gemini => json!({
            "contents": [{"role": "user", "parts": [{"text": "Hi"}]}],
            "generationConfig": {"maxOutputTokens": 1}
        }),
    }
}

fn probe_url(endpoint: &Endpoint) -> String {
    let base = endpoint.api_url.trim_end_matches('/');
    match endpoint.upstream_dialect {
        UpstreamDialect::Claude => format!("{base}/v1/messages"),
        UpstreamDialect::OpenaiChat => format!("{base}/v1/chat/completions"),
        UpstreamDialect::OpenaiResponses => format!("{base}/v1/responses"),
        UpstreamDialect::Gemini => {
            let model = endpoint.model.clone().unwrap_or_else(|| "gemini-1.5-flash".to_string());
            let key = endpoint.api_key.clone().unwrap_or_default();
            format!("{base}/v1beta/models/{model}:generateContent?key={key}")
        }
    }
}

fn well_formed(body: &Value) -> bool {
    if body.get("error").is_some() {
        return false;
    }
    let has_content = body.get("content").and_then(|c| c.as_array()).map(|a| !a.is_empty()).unwrap_or(false);
    let has_choices = body.get("choices").and_then(|c| c.as_array()).map(|a| !a.is_empty()).unwrap_or(false);
    let has_candidates = body.get("candidates").and_then(|c| c.as_array()).map(|a| !a.is_empty()).unwrap_or(false);
    let has_output = body.get("output").and_then(|c| c.as_array()).map(|a| !a.is_empty()).unwrap_or(false);
    has_content || has_choices || has_candidates || has_output
}

async fn probe_one(client: &Client, endpoint: &Endpoint) -> (ProbeOutcome, Option<f64>) {
    let url = probe_url(endpoint);
    let body = minimal_probe_body(endpoint);
    let mut req = client
        .post(&url)
        .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
        .json(&body);

    req = match endpoint.upstream_dialect {
        UpstreamDialect::Claude => req
            .header("x-api-key", endpoint.api_key.clone().unwrap_or_default())
            .header("anthropic-version", "2023-06-01"),
        UpstreamDialect::OpenaiChat | UpstreamDialect::OpenaiResponses => {
            req.bearer_auth(endpoint.api_key.clone().unwrap_or_default())
        }
        UpstreamDialect::Gemini => req,
    };

    let start = Instant::now();
    let resp = match req.send().await {
        Ok(r) => r,
        Err(_) => return (ProbeOutcome::Other, None),
    };
    let status = resp.status();
    let elapsed_ms = start.elapsed().as_millis() as f64;

    if status.as_u16() == 401 || status.as_u16() == 403 {
        return (ProbeOutcome::AuthFailed, Some(elapsed_ms));
    }

    let body: Value = match resp.json().await {
        Ok(v) => v,
        Err(_) => return (ProbeOutcome::Other, None),
    };

    if status.is_success() && well_formed(&body) {
        (ProbeOutcome::Ok, Some(elapsed_ms))
    } else {
        (ProbeOutcome::Other, None)
    }
}

fn maybe_alert(name: &str, reason: &str) {
    let cfg = config::load().health_prober.clone();
    let mut state = STATE.lock().unwrap();
    let cooldown = Duration::from_secs(cfg.alert_cooldown_secs);
    let should_fire = state
        .last_alert
        .get(name)
        .map(|t| t.elapsed() >= cooldown)
        .unwrap_or(true);
    if should_fire {
        state.last_alert.insert(name.to_string(), Instant::now());
        crate::logger::warn("health", &format!("ALERT endpoint {name}: {reason}"));
    }
}

async fn set_endpoint_status(name: &str, status: EndpointStatus) {
    let mut cfg = (*config::load()).clone();
    if let Some(ep) = cfg.endpoints.iter_mut().find(|e| e.name == name) {
        if ep.status == status {
            return;
        }
        ep.status = status;
        if let Err(e) = config::update(cfg) {
            crate::logger::warn("health", &format!("failed to persist status for {name}: {e}"));
        }
    }
}

async fn probe_endpoint(client: &Client, endpoint: Endpoint) {
    let name = endpoint.name.clone();
    let (outcome, latency_ms) = probe_one(client, &endpoint).await;
    let cfg = config::load().health_prober.clone();

    match outcome {
        ProbeOutcome::Ok => {
            if let Some(ms) = latency_ms {
                monitor::record_probe_latency(&name, ms);
                let prior_avg = monitor::avg_response_time(&name);
                let exceeds_absolute = ms >= cfg.latency_alert_ms as f64;
                let exceeds_relative = prior_avg
                    .map(|avg| ms >= avg * (1.0 + cfg.latency_increase_percent / 100.0))
                    .unwrap_or(false);
                if exceeds_absolute || exceeds_relative {
                    maybe_alert(&name, &format!("latency {ms}ms exceeds threshold"));
                }
            }
            STATE.lock().unwrap().consecutive_failures.insert(name.clone(), 0);
            if endpoint.status != EndpointStatus::Available {
                set_endpoint_status(&name, EndpointStatus::Available).await;
            }
        }
        ProbeOutcome::AuthFailed => {
            let mut state = STATE.lock().unwrap();
            let count = state.consecutive_failures.entry(name.clone()).or_insert(0);
            *count += 1;
        }
        ProbeOutcome::Other => {
            let threshold = cfg.consecutive_failure_threshold;
            let count = {
                let mut state = STATE.lock().unwrap();
                let count = state.consecutive_failures.entry(name.clone()).or_insert(0);
                *count += 1;
                *count
            };
            if count >= threshold {
                maybe_alert(&name, &format!("{count} consecutive probe failures"));
                if endpoint.status == EndpointStatus::Available {
                    set_endpoint_status(&name, EndpointStatus::Unavailable).await;
                }
            }
        }
    }
}

async fn run_once() {
    let cfg = config::load();
    if cfg.health_prober.interval_secs == 0 {
        return;
    }
    let client = match crate::forward::client::default_client() {
        Ok(c) => c,
        Err(_) => return,
    };
    for endpoint in cfg.endpoints.iter().filter(|e| e.status != EndpointStatus::Disabled).cloned() {
        probe_endpoint(&client, endpoint).await;
    }
}

/// Spawn the background probe loop. Re-reads the interval each tick so a
/// config update (including disabling the prober with `interval_secs = 0`)
/// takes effect without a restart.
pub fn spawn() {
    tokio::spawn(async {
        loop {
            let interval_secs = config::load().health_prober.interval_secs;
            if interval_secs == 0 {
                tokio::time::sleep(Duration::from_secs(10)).await;
                continue;
            }
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
            run_once().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_rejects_error_field() {
        let body = json!({"error": {"message": "bad"}, "content": [{"text": "hi"}]});
        assert!(!well_formed(&body));
    }

    #[test]
    fn well_formed_accepts_any_known_shape() {
        assert!(well_formed(&json!({"content": [{"text": "hi"}]})));
        assert!(well_formed(&json!({"choices": [{"message": {}}]})));
        assert!(well_formed(&json!({"candidates": [{}]})));
        assert!(!well_formed(&json!({"content": []})));
    }

    #[test]
    fn probe_url_maps_claude_to_messages_path() {
        let ep = Endpoint {
            api_url: "https://api.anthropic.com".to_string(),
            upstream_dialect: UpstreamDialect::Claude,
            ..Default::default()
        };
        assert_eq!(probe_url(&ep), "https://api.anthropic.com/v1/messages");
    }
}
