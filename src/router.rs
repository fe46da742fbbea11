//! Multi-stage endpoint selection (component I): session affinity, then
//! filter by model pattern and quota, then rank by cost/load/priority.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{self, ClientKind, Endpoint, EndpointStatus, LoadBalanceAlgorithm};
use crate::forward::cancel;
use crate::{monitor, quota, session};

/// Shared, mutex-protected RNG used for every tie-break and weighted draw
/// so selection stays deterministic under a fixed seed in tests and never
/// pays the cost of a fresh OS-entropy pull per request.
static RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::from_entropy()));

static ROUND_ROBIN_INDEX: Lazy<Mutex<HashMap<String, usize>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Glob grammar: empty or `*` match-all; `prefix*`; `*suffix`; exact
/// otherwise; comma separates alternates.
pub fn matches_model_patterns(patterns: &str, model: &str) -> bool {
    let patterns = patterns.trim();
    if patterns.is_empty() || patterns == "*" {
        return true;
    }
    patterns.split(',').any(|raw| {
        let pat = raw.trim();
        if pat.is_empty() || pat == "*" {
            true
        } else if let Some(prefix) = pat.strip_suffix('*') {
            model.starts_with(prefix)
        } else if let Some(suffix) = pat.strip_prefix('*') {
            model.ends_with(suffix)
        } else {
            model == pat
        }
    })
}

fn candidate_set(endpoints: &[Endpoint], client_kind: ClientKind) -> Vec<Endpoint> {
    endpoints
        .iter()
        .filter(|e| e.client_kind == client_kind)
        .filter(|e| matches!(e.status, EndpointStatus::Available | EndpointStatus::Untested))
        .cloned()
        .collect()
}

fn filter_by_model(candidates: Vec<Endpoint>, model: &str, enabled: bool) -> Vec<Endpoint> {
    if !enabled {
        return candidates;
    }
    let filtered: Vec<Endpoint> = candidates
        .iter()
        .filter(|e| matches_model_patterns(&e.model_patterns, model))
        .cloned()
        .collect();
    if filtered.is_empty() {
        candidates
    } else {
        filtered
    }
}

fn filter_by_quota(candidates: Vec<Endpoint>, client_kind: ClientKind, enabled: bool) -> Vec<Endpoint> {
    if !enabled {
        return candidates;
    }
    let filtered: Vec<Endpoint> = candidates
        .iter()
        .filter(|e| {
            e.quota_limit == 0 || !quota::is_exhausted(&e.name, client_kind.as_str(), e.quota_limit)
        })
        .cloned()
        .collect();
    if filtered.is_empty() {
        candidates
    } else {
        filtered
    }
}

fn pick_random_among_min_priority(candidates: &[Endpoint]) -> Endpoint {
    let min_priority = candidates.iter().map(|e| e.priority).min().unwrap_or(0);
    let tied: Vec<&Endpoint> = candidates.iter().filter(|e| e.priority == min_priority).collect();
    let idx = RNG.lock().unwrap().gen_range(0..tied.len());
    tied[idx].clone()
}

fn rank(candidates: Vec<Endpoint>, client_kind: ClientKind, routing: &config::RoutingConfig) -> Option<Endpoint> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(candidates[0].clone());
    }

    if routing.enable_cost_priority {
        let mut sorted = candidates;
        sorted.sort_by(|a, b| {
            let cost_a = a.cost_per_input_token + a.cost_per_output_token;
            let cost_b = b.cost_per_input_token + b.cost_per_output_token;
            cost_a
                .partial_cmp(&cost_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.priority.cmp(&b.priority))
        });
        return sorted.into_iter().next();
    }

    if routing.enable_load_balance {
        return match routing.load_balance_algorithm {
            LoadBalanceAlgorithm::Fastest => {
                let mut best: Option<(&Endpoint, f64)> = None;
                for ep in &candidates {
                    if let Some(avg) = monitor::avg_response_time(&ep.name) {
                        if best.as_ref().map(|(_, b)| avg < *b).unwrap_or(true) {
                            best = Some((ep, avg));
                        }
                    }
                }
                Some(best.map(|(e, _)| e.clone()).unwrap_or_else(|| candidates[0].clone()))
            }
            LoadBalanceAlgorithm::Weighted => {
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|e| monitor::avg_response_time(&e.name).map(|a| if a > 0.0 { 1.0 / a } else { 1.0 }).unwrap_or(1.0))
                    .collect();
                let total: f64 = weights.iter().sum();
                let mut draw = RNG.lock().unwrap().gen_range(0.0..total.max(f64::MIN_POSITIVE));
                for (ep, w) in candidates.iter().zip(weights.iter()) {
                    if draw < *w {
                        return Some(ep.clone());
                    }
                    draw -= w;
                }
                Some(candidates.last().unwrap().clone())
            }
            LoadBalanceAlgorithm::RoundRobin => {
                let key = client_kind.as_str().to_string();
                let mut indexes = ROUND_ROBIN_INDEX.lock().unwrap();
                let idx = indexes.entry(key).or_insert(0);
                let chosen = candidates[*idx % candidates.len()].clone();
                *idx = (*idx + 1) % candidates.len();
                Some(chosen)
            }
        };
    }

    Some(pick_random_among_min_priority(&candidates))
}

/// `SelectEndpoint(clientKind, requestModel, sessionID) → endpoint`.
pub fn select_endpoint(client_kind: ClientKind, request_model: &str, session_id: Option<&str>) -> Option<Endpoint> {
    let cfg = config::load();

    if let Some(sid) = session_id {
        if let Some(bound_name) = session::lookup(sid) {
            if let Some(ep) = cfg.endpoints.iter().find(|e| e.name == bound_name) {
                if matches!(ep.status, EndpointStatus::Available | EndpointStatus::Untested) {
                    cancel::set_current(client_kind, &ep.name);
                    return Some(ep.clone());
                }
            }
            session::unbind(sid);
        }
    }

    let candidates = candidate_set(&cfg.endpoints, client_kind);
    let candidates = filter_by_model(candidates, request_model, cfg.routing.enable_model_routing);
    let candidates = filter_by_quota(candidates, client_kind, cfg.routing.enable_quota_routing);

    let chosen = rank(candidates, client_kind, &cfg.routing)?;

    if let Some(sid) = session_id {
        session::bind(sid, client_kind, &chosen.name);
    }

    cancel::set_current(client_kind, &chosen.name);
    Some(chosen)
}

/// Manual switch entry point (§4.1): pin `endpoint_name` as the current
/// endpoint for `client_kind`, cancelling any in-flight stream still bound
/// to whatever endpoint was current before it.
pub fn switch_endpoint(client_kind: ClientKind, endpoint_name: &str) {
    cancel::switch_endpoint(client_kind, endpoint_name);
}

/// Flip `name`'s status to `unavailable` if it is currently `untested`. The
/// dispatch engine calls this before picking the next candidate on a failed
/// attempt, so the downgrade is visible to the very next `select_endpoint`
/// call in the same retry loop (see `rotation_downgrades_before_next_pick`).
pub fn downgrade_if_untested(name: &str) {
    let mut cfg = (*config::load()).clone();
    if let Some(ep) = cfg.endpoints.iter_mut().find(|e| e.name == name) {
        if ep.status == EndpointStatus::Untested {
            ep.status = EndpointStatus::Unavailable;
            let _ = config::update(cfg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QuotaResetCycle, Settings, UpstreamDialect};

    fn endpoint(name: &str, priority: u32) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            client_kind: ClientKind::Claude,
            api_url: "https://example.invalid".to_string(),
            upstream_dialect: UpstreamDialect::Claude,
            status: EndpointStatus::Available,
            priority,
            ..Default::default()
        }
    }

    #[test]
    fn model_pattern_grammar() {
        assert!(matches_model_patterns("", "claude-3-opus"));
        assert!(matches_model_patterns("*", "claude-3-opus"));
        assert!(matches_model_patterns("claude-3*", "claude-3-opus"));
        assert!(matches_model_patterns("*-opus", "claude-3-opus"));
        assert!(matches_model_patterns("gpt-4o,claude-3-opus", "claude-3-opus"));
        assert!(!matches_model_patterns("gpt-4o", "claude-3-opus"));
    }

    #[test]
    fn s1_priority_tie_break_is_roughly_even() {
        let a = endpoint("A", 100);
        let b = endpoint("B", 100);
        let c = endpoint("C", 200);
        let candidates = vec![a, b, c];
        let routing = config::RoutingConfig {
            enable_model_routing: false,
            enable_quota_routing: false,
            enable_cost_priority: false,
            enable_load_balance: false,
            load_balance_algorithm: LoadBalanceAlgorithm::RoundRobin,
        };

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..1000 {
            let chosen = rank(candidates.clone(), ClientKind::Claude, &routing).unwrap();
            *counts.entry(chosen.name).or_insert(0) += 1;
        }

        assert_eq!(*counts.get("C").unwrap_or(&0), 0);
        let a_count = *counts.get("A").unwrap_or(&0) as i64;
        let b_count = *counts.get("B").unwrap_or(&0) as i64;
        assert!((a_count - 500).abs() <= 75, "A count {a_count} too far from 500");
        assert!((b_count - 500).abs() <= 75, "B count {b_count} too far from 500");
    }

    #[test]
    fn s2_cost_priority_always_picks_cheapest() {
        let mut a = endpoint("A", 100);
        a.cost_per_input_token = 3.0;
        a.cost_per_output_token = 15.0;
        let mut b = endpoint("B", 100);
        b.cost_per_input_token = 2.5;
        b.cost_per_output_token = 10.0;
        let mut c = endpoint("C", 100);
        c.cost_per_input_token = 15.0;
        c.cost_per_output_token = 75.0;

        let routing = config::RoutingConfig {
            enable_model_routing: false,
            enable_quota_routing: false,
            enable_cost_priority: true,
            enable_load_balance: false,
            load_balance_algorithm: LoadBalanceAlgorithm::RoundRobin,
        };

        for _ in 0..10 {
            let chosen = rank(vec![a.clone(), b.clone(), c.clone()], ClientKind::Claude, &routing).unwrap();
            assert_eq!(chosen.name, "B");
        }
    }

    #[test]
    fn rotation_downgrades_before_next_pick() {
        let mut cfg = Settings::default();
        let mut a = endpoint("RotA", 100);
        a.status = EndpointStatus::Untested;
        let b = endpoint("RotB", 100);
        cfg.endpoints = vec![a, b];
        config::update(cfg).unwrap();

        downgrade_if_untested("RotA");

        let reloaded = config::load();
        let a = reloaded.endpoints.iter().find(|e| e.name == "RotA").unwrap();
        assert_eq!(a.status, EndpointStatus::Unavailable);

        let chosen = select_endpoint(ClientKind::Claude, "any-model", None).unwrap();
        assert_eq!(chosen.name, "RotB");
    }

    #[test]
    fn quota_exhaustion_excludes_endpoint_unless_all_exhausted() {
        let a = endpoint("QuotaA", 100);
        let mut a = a;
        a.quota_limit = 100;
        quota::record_usage("QuotaA", "claude", QuotaResetCycle::Never, 100, 100);
        let b = endpoint("QuotaB", 100);

        let candidates = filter_by_quota(vec![a, b], ClientKind::Claude, true);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "QuotaB");
    }
}
