//! Request limiting utilities (RPM, budgets, concurrency).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::Response;
use chrono::Utc;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use crate::config::QuotaResetCycle;
use crate::{config, db, logger, quota};

use super::error::{ForwardError, ForwardResult};

/// No natural reset boundary exists for a concurrency-slot or misconfigured
/// cap, so these denials get a short fixed hint instead (§4.9).
const FIXED_RETRY_HINT_SECS: u64 = 1;

#[derive(Default)]
struct LimitState {
    rpm_window: VecDeque<Instant>,
    per_endpoint_rpm_window: HashMap<String, VecDeque<Instant>>,
    concurrent_total: u32,
    concurrent_by_session: HashMap<String, u32>,
}

static LIMIT_STATE: Lazy<Arc<Mutex<LimitState>>> =
    Lazy::new(|| Arc::new(Mutex::new(LimitState::default())));

#[derive(Clone)]
pub struct LimitGuard {
    session_id: Option<String>,
    state: Arc<Mutex<LimitState>>,
}

impl LimitGuard {
    fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            state: Arc::clone(&LIMIT_STATE),
        }
    }
}

impl Drop for LimitGuard {
    fn drop(&mut self) {
        let session_id = self.session_id.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut guard = state.lock().await;
            if guard.concurrent_total > 0 {
                guard.concurrent_total -= 1;
            }
            if let Some(session_id) = session_id {
                if let Some(count) = guard.concurrent_by_session.get_mut(&session_id) {
                    if *count > 0 {
                        *count -= 1;
                    }
                    if *count == 0 {
                        guard.concurrent_by_session.remove(&session_id);
                    }
                }
            }
        });
    }
}

/// Seconds until `cycle`'s current period rolls over, for the `Retry-After`
/// on a budget denial — there's no rolling window to drain, just the next
/// daily/weekly/monthly boundary.
fn budget_retry_after_secs(cycle: QuotaResetCycle) -> u64 {
    let now = Utc::now();
    let (_, end) = quota::period_bounds(cycle, now);
    (end - now).num_seconds().max(1) as u64
}

fn budget_remaining(limit: Option<f64>, spent: f64, label: &str, cycle: QuotaResetCycle) -> ForwardResult<()> {
    let Some(limit) = limit else {
        return Ok(());
    };
    if limit <= 0.0 {
        return Err(ForwardError::RateLimited(
            format!("{} budget is <= 0; all requests are blocked", label),
            budget_retry_after_secs(cycle),
        ));
    }
    if spent >= limit {
        return Err(ForwardError::RateLimited(
            format!(
                "{} budget exceeded: spent ${:.6} / limit ${:.6}",
                label, spent, limit
            ),
            budget_retry_after_secs(cycle),
        ));
    }
    Ok(())
}

fn check_budgets(limits: &config::RateLimitConfig) -> ForwardResult<()> {
    if limits.budget_daily_usd.is_some() {
        let (_, _, spent) = db::summary_for_range("daily");
        budget_remaining(limits.budget_daily_usd, spent, "Daily", QuotaResetCycle::Daily)?;
    }
    if limits.budget_weekly_usd.is_some() {
        let (_, _, spent) = db::summary_for_range("weekly");
        budget_remaining(limits.budget_weekly_usd, spent, "Weekly", QuotaResetCycle::Weekly)?;
    }
    if limits.budget_monthly_usd.is_some() {
        let (_, _, spent) = db::summary_for_range("monthly");
        budget_remaining(limits.budget_monthly_usd, spent, "Monthly", QuotaResetCycle::Monthly)?;
    }
    Ok(())
}

fn clean_rpm_window(window: &mut VecDeque<Instant>) {
    let cutoff = Instant::now() - Duration::from_secs(60);
    while matches!(window.front(), Some(ts) if *ts < cutoff) {
        window.pop_front();
    }
}

/// Seconds until the oldest entry in a 60s rolling window ages out, i.e. how
/// long until the window has room for one more request.
fn window_retry_after_secs(window: &VecDeque<Instant>) -> u64 {
    match window.front() {
        Some(oldest) => {
            let age = oldest.elapsed();
            Duration::from_secs(60).saturating_sub(age).as_secs().max(1)
        }
        None => 60,
    }
}

/// Admission check for the dispatch engine's rate limiter (component F).
///
/// `endpoint_name` is `None` until the router has picked a candidate; dispatch
/// calls this once up front (global-only) and again per selected endpoint.
pub async fn check_and_acquire(
    session_id: Option<String>,
    endpoint_name: Option<&str>,
) -> ForwardResult<Option<LimitGuard>> {
    let cfg = config::load();
    let limits = cfg.limits.clone();

    if !limits.enabled {
        return Ok(None);
    }

    let has_limits = limits.rpm.is_some()
        || limits.per_endpoint_rpm.is_some()
        || limits.max_concurrent.is_some()
        || limits.max_concurrent_per_session.is_some()
        || limits.budget_daily_usd.is_some()
        || limits.budget_weekly_usd.is_some()
        || limits.budget_monthly_usd.is_some();

    if !has_limits {
        return Ok(None);
    }

    check_budgets(&limits)?;

    let session_key = session_id.clone().unwrap_or_else(|| "anonymous".to_string());

    let mut state = LIMIT_STATE.lock().await;

    if let Some(rpm) = limits.rpm {
        if rpm > 0 {
            clean_rpm_window(&mut state.rpm_window);
            if state.rpm_window.len() as u32 >= rpm {
                return Err(ForwardError::RateLimited(
                    format!("RPM limit exceeded: {} per minute", rpm),
                    window_retry_after_secs(&state.rpm_window),
                ));
            }
            state.rpm_window.push_back(Instant::now());
        } else {
            return Err(ForwardError::RateLimited(
                "RPM limit is <= 0; all requests are blocked".to_string(),
                FIXED_RETRY_HINT_SECS,
            ));
        }
    }

    if let (Some(rpm), Some(name)) = (limits.per_endpoint_rpm, endpoint_name) {
        if rpm > 0 {
            let window = state
                .per_endpoint_rpm_window
                .entry(name.to_string())
                .or_default();
            clean_rpm_window(window);
            if window.len() as u32 >= rpm {
                return Err(ForwardError::RateLimited(
                    format!("Per-endpoint RPM limit exceeded for {}: {} per minute", name, rpm),
                    window_retry_after_secs(window),
                ));
            }
            window.push_back(Instant::now());
        } else {
            return Err(ForwardError::RateLimited(
                format!("Per-endpoint RPM limit for {} is <= 0; all requests are blocked", name),
                FIXED_RETRY_HINT_SECS,
            ));
        }
    }

    if let Some(max) = limits.max_concurrent {
        if max == 0 {
            return Err(ForwardError::RateLimited(
                "Concurrency limit is 0; all requests are blocked".to_string(),
                FIXED_RETRY_HINT_SECS,
            ));
        }
        if state.concurrent_total + 1 > max {
            return Err(ForwardError::RateLimited(
                format!("Concurrency limit exceeded: {} in-flight", max),
                FIXED_RETRY_HINT_SECS,
            ));
        }
    }

    if let Some(max) = limits.max_concurrent_per_session {
        if max == 0 {
            return Err(ForwardError::RateLimited(
                "Session concurrency limit is 0; all requests are blocked".to_string(),
                FIXED_RETRY_HINT_SECS,
            ));
        }
        let current = state
            .concurrent_by_session
            .get(&session_key)
            .copied()
            .unwrap_or(0);
        if current + 1 > max {
            return Err(ForwardError::RateLimited(
                format!("Session concurrency limit exceeded: {} in-flight", max),
                FIXED_RETRY_HINT_SECS,
            ));
        }
    }

    state.concurrent_total += 1;
    if limits.max_concurrent_per_session.is_some() {
        let entry = state.concurrent_by_session.entry(session_key).or_insert(0);
        *entry += 1;
    }

    logger::debug(
        "limits",
        &format!(
            "Acquired limit guard: total_in_flight={}, session={:?}",
            state.concurrent_total,
            session_id
        ),
    );

    Ok(Some(LimitGuard::new(session_id)))
}

pub fn attach_guard(mut response: Response, guard: Option<LimitGuard>) -> Response {
    if let Some(guard) = guard {
        response.extensions_mut().insert(guard);
    }
    response
}
