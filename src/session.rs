//! Session affinity: sticky binding of a session id to the endpoint it last
//! used successfully (component H).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::config::{self, ClientKind};

#[derive(Clone, Debug)]
pub struct SessionBinding {
    pub session_id: String,
    pub endpoint_name: String,
    pub client_kind: ClientKind,
    pub created_at: Instant,
    pub last_access: Instant,
    pub request_count: u64,
}

#[derive(Default)]
struct SessionState {
    bindings: HashMap<String, SessionBinding>,
    by_endpoint: HashMap<String, HashSet<String>>,
}

static STATE: Lazy<Mutex<SessionState>> = Lazy::new(|| Mutex::new(SessionState::default()));

fn ttl() -> Duration {
    Duration::from_secs(config::load().session_affinity.ttl_secs)
}

fn unbind_locked(state: &mut SessionState, session_id: &str) {
    if let Some(binding) = state.bindings.remove(session_id) {
        if let Some(set) = state.by_endpoint.get_mut(&binding.endpoint_name) {
            set.remove(session_id);
        }
    }
}

/// Return the bound endpoint name for `session_id` if the binding exists and
/// hasn't expired. Does not check the endpoint's current status; callers
/// (the router) are responsible for re-checking status and calling
/// [`unbind`] when the bound endpoint is no longer eligible.
pub fn lookup(session_id: &str) -> Option<String> {
    let mut state = STATE.lock().unwrap();
    let expired = state
        .bindings
        .get(session_id)
        .map(|b| b.last_access.elapsed() > ttl())
        .unwrap_or(false);
    if expired {
        unbind_locked(&mut state, session_id);
        return None;
    }
    if let Some(binding) = state.bindings.get_mut(session_id) {
        binding.last_access = Instant::now();
        binding.request_count += 1;
        return Some(binding.endpoint_name.clone());
    }
    None
}

/// Bind `session_id` to `endpoint_name`, respecting an optional
/// per-endpoint concurrent-binding cap. Returns `false` (no binding made)
/// when the cap is already at capacity.
pub fn bind(session_id: &str, client_kind: ClientKind, endpoint_name: &str) -> bool {
    let cfg = config::load().session_affinity.clone();
    if !cfg.enabled {
        return false;
    }
    let mut state = STATE.lock().unwrap();

    if let Some(max) = cfg.max_concurrent_per_endpoint {
        let current = state
            .by_endpoint
            .get(endpoint_name)
            .map(|s| s.len() as u32)
            .unwrap_or(0);
        let already_bound_here = state
            .bindings
            .get(session_id)
            .map(|b| b.endpoint_name == endpoint_name)
            .unwrap_or(false);
        if !already_bound_here && current >= max {
            return false;
        }
    }

    unbind_locked(&mut state, session_id);
    let now = Instant::now();
    state.bindings.insert(
        session_id.to_string(),
        SessionBinding {
            session_id: session_id.to_string(),
            endpoint_name: endpoint_name.to_string(),
            client_kind,
            created_at: now,
            last_access: now,
            request_count: 1,
        },
    );
    state
        .by_endpoint
        .entry(endpoint_name.to_string())
        .or_default()
        .insert(session_id.to_string());
    true
}

pub fn unbind(session_id: &str) {
    let mut state = STATE.lock().unwrap();
    unbind_locked(&mut state, session_id);
}

fn sweep_once() {
    let ttl = ttl();
    let mut state = STATE.lock().unwrap();
    let expired: Vec<String> = state
        .bindings
        .iter()
        .filter(|(_, b)| b.last_access.elapsed() > ttl)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &expired {
        unbind_locked(&mut state, id);
    }
    if !expired.is_empty() {
        crate::logger::debug(
            "session",
            &format!("swept {} expired session bindings", expired.len()),
        );
    }
}

/// Spawn the hourly background sweeper. Call once at startup.
pub fn spawn_sweeper() {
    tokio::spawn(async {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            sweep_once();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_then_lookup_round_trips() {
        let sid = "sess-round-trip-1";
        unbind(sid);
        assert!(bind(sid, ClientKind::Claude, "ep-a"));
        assert_eq!(lookup(sid), Some("ep-a".to_string()));
        unbind(sid);
        assert_eq!(lookup(sid), None);
    }

    #[test]
    fn rebinding_moves_endpoint_membership() {
        let sid = "sess-rebind-1";
        unbind(sid);
        assert!(bind(sid, ClientKind::Claude, "ep-a"));
        assert!(bind(sid, ClientKind::Claude, "ep-b"));
        assert_eq!(lookup(sid), Some("ep-b".to_string()));
        unbind(sid);
    }
}
