//! In-flight request registry, per-endpoint rolling latency, and health
//! classification (component G).
//!
//! One mutex guards both the active-request map and the per-endpoint
//! metrics; the monitor's event callbacks fire while the lock is held, so
//! subscribers must be non-blocking (they queue externally if they need to
//! do real work).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;

const LATENCY_WINDOW: usize = 100;
const ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestPhase {
    Waiting,
    Connecting,
    Sending,
    Streaming,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct ActiveRequest {
    pub request_id: String,
    pub endpoint_name: String,
    pub client_kind: String,
    pub model: String,
    #[serde(skip)]
    pub start_time: Instant,
    pub phase: RequestPhase,
    pub bytes_received: u64,
    pub preview: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct EndpointMetric {
    pub active_count: u32,
    pub total_requests: u64,
    pub success_count: u64,
    pub avg_response_time: f64,
    pub success_rate: f64,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub last_error_time: Option<Instant>,
}

impl Default for EndpointMetric {
    fn default() -> Self {
        Self {
            active_count: 0,
            total_requests: 0,
            success_count: 0,
            avg_response_time: 0.0,
            success_rate: 100.0,
            last_error: None,
            last_error_time: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
    Unknown,
}

#[derive(Clone, Debug)]
pub enum MonitorEvent {
    RequestStarted(ActiveRequest),
    RequestUpdated(ActiveRequest),
    RequestCompleted { request_id: String, success: bool },
    MetricsUpdated { endpoint: String, metric: EndpointMetric },
}

type EventCallback = Box<dyn Fn(MonitorEvent) + Send + Sync>;

#[derive(Default)]
struct MonitorState {
    active: HashMap<String, ActiveRequest>,
    metrics: HashMap<String, EndpointMetric>,
    latency: HashMap<String, VecDeque<f64>>,
    probe_latency: HashMap<String, f64>,
    callbacks: Vec<Arc<EventCallback>>,
}

static STATE: Lazy<Mutex<MonitorState>> = Lazy::new(|| Mutex::new(MonitorState::default()));

fn emit(state: &MonitorState, event: MonitorEvent) {
    for cb in &state.callbacks {
        cb(event.clone());
    }
}

impl Clone for MonitorEvent {
    fn clone(&self) -> Self {
        match self {
            MonitorEvent::RequestStarted(r) => MonitorEvent::RequestStarted(r.clone()),
            MonitorEvent::RequestUpdated(r) => MonitorEvent::RequestUpdated(r.clone()),
            MonitorEvent::RequestCompleted { request_id, success } => {
                MonitorEvent::RequestCompleted { request_id: request_id.clone(), success: *success }
            }
            MonitorEvent::MetricsUpdated { endpoint, metric } => MonitorEvent::MetricsUpdated {
                endpoint: endpoint.clone(),
                metric: metric.clone(),
            },
        }
    }
}

/// Register a non-blocking subscriber for monitor events. The callback runs
/// under the monitor's internal lock; it must not block or re-enter the
/// monitor API.
pub fn subscribe(cb: impl Fn(MonitorEvent) + Send + Sync + 'static) {
    STATE.lock().unwrap().callbacks.push(Arc::new(Box::new(cb)));
}

pub fn start_request(request_id: &str, endpoint_name: &str, client_kind: &str, model: &str) {
    let mut state = STATE.lock().unwrap();
    let req = ActiveRequest {
        request_id: request_id.to_string(),
        endpoint_name: endpoint_name.to_string(),
        client_kind: client_kind.to_string(),
        model: model.to_string(),
        start_time: Instant::now(),
        phase: RequestPhase::Waiting,
        bytes_received: 0,
        preview: String::new(),
    };
    state.active.insert(request_id.to_string(), req.clone());
    let metric = state.metrics.entry(endpoint_name.to_string()).or_default();
    metric.active_count += 1;
    metric.total_requests += 1;
    emit(&state, MonitorEvent::RequestStarted(req));
}

pub fn update_phase(request_id: &str, phase: RequestPhase) {
    let mut state = STATE.lock().unwrap();
    if let Some(req) = state.active.get_mut(request_id) {
        req.phase = phase;
        let snapshot = req.clone();
        emit(&state, MonitorEvent::RequestUpdated(snapshot));
    }
}

pub fn update_bytes(request_id: &str, bytes: u64, preview: Option<&str>) {
    let mut state = STATE.lock().unwrap();
    if let Some(req) = state.active.get_mut(request_id) {
        req.bytes_received += bytes;
        if let Some(p) = preview {
            req.preview = p.chars().take(200).collect();
        }
        let snapshot = req.clone();
        emit(&state, MonitorEvent::RequestUpdated(snapshot));
    }
}

/// Complete a request: remove it from the active set, fold its latency into
/// the endpoint's rolling window, and update success/error counters.
pub fn complete_request(request_id: &str, success: bool, error: Option<&str>) {
    let mut state = STATE.lock().unwrap();
    let Some(req) = state.active.remove(request_id) else {
        return;
    };
    let elapsed_ms = req.start_time.elapsed().as_millis() as f64;
    let endpoint = req.endpoint_name.clone();

    {
        let window = state.latency.entry(endpoint.clone()).or_default();
        window.push_back(elapsed_ms);
        if window.len() > LATENCY_WINDOW {
            window.pop_front();
        }
    }
    let avg = {
        let window = state.latency.get(&endpoint).unwrap();
        window.iter().sum::<f64>() / window.len() as f64
    };

    let metric = state.metrics.entry(endpoint.clone()).or_default();
    if metric.active_count > 0 {
        metric.active_count -= 1;
    }
    if success {
        metric.success_count += 1;
    } else {
        metric.last_error = error.map(|e| e.chars().take(500).collect());
        metric.last_error_time = Some(Instant::now());
    }
    metric.avg_response_time = avg;
    metric.success_rate = if metric.total_requests == 0 {
        100.0
    } else {
        100.0 * metric.success_count as f64 / metric.total_requests as f64
    };
    let metric_snapshot = metric.clone();

    emit(&state, MonitorEvent::RequestCompleted { request_id: request_id.to_string(), success });
    emit(
        &state,
        MonitorEvent::MetricsUpdated { endpoint: endpoint.clone(), metric: metric_snapshot },
    );
}

pub fn active_count(endpoint: &str) -> u32 {
    STATE
        .lock()
        .unwrap()
        .metrics
        .get(endpoint)
        .map(|m| m.active_count)
        .unwrap_or(0)
}

pub fn avg_response_time(endpoint: &str) -> Option<f64> {
    let state = STATE.lock().unwrap();
    let window = state.latency.get(endpoint)?;
    if window.is_empty() {
        return None;
    }
    Some(window.iter().sum::<f64>() / window.len() as f64)
}

/// Fed by the health prober (L) when request traffic hasn't produced samples yet.
pub fn record_probe_latency(endpoint: &str, ms: f64) {
    STATE.lock().unwrap().probe_latency.insert(endpoint.to_string(), ms);
}

pub fn metric_for(endpoint: &str) -> EndpointMetric {
    STATE.lock().unwrap().metrics.get(endpoint).cloned().unwrap_or_default()
}

pub fn health_status(endpoint: &str) -> HealthStatus {
    let state = STATE.lock().unwrap();
    let metric = match state.metrics.get(endpoint) {
        Some(m) => m,
        None => {
            return if state.probe_latency.contains_key(endpoint) {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unknown
            }
        }
    };
    if metric.total_requests == 0 {
        return if state.probe_latency.contains_key(endpoint) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        };
    }
    let recent_error = metric
        .last_error_time
        .map(|t| t.elapsed() < ERROR_WINDOW)
        .unwrap_or(false);
    if recent_error || metric.success_rate < 80.0 {
        HealthStatus::Error
    } else if metric.success_rate < 95.0 {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_count_matches_in_flight_requests() {
        let ep = "test-monitor-ep-1";
        start_request("req-1", ep, "claude", "claude-3");
        start_request("req-2", ep, "claude", "claude-3");
        assert_eq!(active_count(ep), 2);

        complete_request("req-1", true, None);
        assert_eq!(active_count(ep), 1);

        complete_request("req-2", true, None);
        assert_eq!(active_count(ep), 0);
    }

    #[test]
    fn health_classification_thresholds() {
        let ep = "test-monitor-ep-2";
        for _ in 0..10 {
            start_request("req", ep, "claude", "claude-3");
            complete_request("req", true, None);
        }
        assert_eq!(health_status(ep), HealthStatus::Healthy);

        start_request("req", ep, "claude", "claude-3");
        complete_request("req", false, Some("boom"));
        // 10/11 success = ~90.9% -> warning
        assert_eq!(health_status(ep), HealthStatus::Warning);
    }

    #[test]
    fn unknown_when_no_samples() {
        assert_eq!(health_status("never-seen-endpoint"), HealthStatus::Unknown);
    }
}
