//! Response cache: fingerprint → body with TTL and oldest-eviction
//! (component E). Streaming responses are never inserted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config;

#[derive(Clone)]
pub struct CacheEntry {
    pub body: Value,
    pub headers: HashMap<String, String>,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub hit_count: u64,
}

static STORE: Lazy<Mutex<HashMap<String, CacheEntry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Canonical cache key fields, per the spec's fingerprint contract.
fn canonicalize(body: &Value) -> Value {
    serde_json::json!({
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "messages": body.get("messages").cloned().unwrap_or(Value::Null),
        "system": body.get("system").cloned().unwrap_or(Value::Null),
        "temperature": body.get("temperature").cloned().unwrap_or(Value::Null),
        "max_tokens": body.get("max_tokens").cloned().unwrap_or(Value::Null),
    })
}

/// SHA-256 hex fingerprint over `{model, messages, system, temperature,
/// max_tokens}`; falls back to hashing the raw bytes if `body` can't be
/// read as JSON (the caller passes `raw` in that case).
fn to_hex(bytes: impl AsRef<[u8]>) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.as_ref().len() * 2);
    for b in bytes.as_ref() {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

pub fn fingerprint(body: &Value) -> String {
    let canonical = canonicalize(body);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    to_hex(hasher.finalize())
}

pub fn fingerprint_raw(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    to_hex(hasher.finalize())
}

pub fn get(key: &str) -> Option<CacheEntry> {
    let mut store = STORE.lock().unwrap();
    let entry = store.get_mut(key)?;
    if entry.expires_at < Instant::now() {
        store.remove(key);
        return None;
    }
    entry.hit_count += 1;
    Some(entry.clone())
}

/// Insert `body` under `key`, evicting the oldest entry first if the store
/// is already at `maxEntries` capacity.
pub fn put(key: String, body: Value, headers: HashMap<String, String>) {
    let cfg = config::load().cache.clone();
    if !cfg.enabled {
        return;
    }
    let now = Instant::now();
    let mut store = STORE.lock().unwrap();

    if store.len() >= cfg.max_entries && !store.contains_key(&key) {
        if let Some(oldest_key) = store
            .iter()
            .min_by_key(|(_, e)| e.created_at)
            .map(|(k, _)| k.clone())
        {
            store.remove(&oldest_key);
        }
    }

    store.insert(
        key,
        CacheEntry {
            body,
            headers,
            created_at: now,
            expires_at: now + Duration::from_secs(cfg.ttl_secs),
            hit_count: 0,
        },
    );
}

pub fn len() -> usize {
    STORE.lock().unwrap().len()
}

fn sweep_once() {
    let now = Instant::now();
    let mut store = STORE.lock().unwrap();
    let before = store.len();
    store.retain(|_, e| e.expires_at >= now);
    let removed = before - store.len();
    if removed > 0 {
        crate::logger::debug("cache", &format!("janitor removed {removed} expired entries"));
    }
}

/// Spawn the 60s expired-entry janitor. Call once at startup.
pub fn spawn_janitor() {
    tokio::spawn(async {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
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
    fn fingerprint_is_stable_for_equivalent_bodies() {
        let a = serde_json::json!({"model": "m", "messages": [1,2], "extra": "ignored"});
        let b = serde_json::json!({"model": "m", "messages": [1,2], "extra": "different"});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_with_messages() {
        let a = serde_json::json!({"model": "m", "messages": [1]});
        let b = serde_json::json!({"model": "m", "messages": [2]});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn get_after_put_returns_same_body() {
        let key = "cache-test-key-1".to_string();
        put(key.clone(), serde_json::json!({"ok": true}), HashMap::new());
        let entry = get(&key).expect("expected cache hit");
        assert_eq!(entry.body, serde_json::json!({"ok": true}));
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let key = "cache-test-key-expired".to_string();
        {
            let mut store = STORE.lock().unwrap();
            store.insert(
                key.clone(),
                CacheEntry {
                    body: serde_json::json!({}),
                    headers: HashMap::new(),
                    created_at: Instant::now() - Duration::from_secs(10),
                    expires_at: Instant::now() - Duration::from_secs(1),
                    hit_count: 0,
                },
            );
        }
        assert!(get(&key).is_none());
    }
}
