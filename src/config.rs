use dirs::data_dir;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::{fs, path::PathBuf};

/// Which inbound path family a request arrived on. Determines the eligible
/// endpoint pool.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Claude,
    Gemini,
    Codex,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Claude => "claude",
            ClientKind::Gemini => "gemini",
            ClientKind::Codex => "codex",
        }
    }
}

/// Schema the inbound client speaks.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ClientDialect {
    Claude,
    OpenaiChat,
    OpenaiResponses,
}

/// Schema the outbound endpoint speaks.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamDialect {
    Claude,
    OpenaiChat,
    OpenaiResponses,
    Gemini,
}

/// Only `Available` and `Untested` are eligible for selection.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Available,
    Untested,
    Unavailable,
    Disabled,
}

impl Default for EndpointStatus {
    fn default() -> Self {
        EndpointStatus::Untested
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QuotaResetCycle {
    Daily,
    Weekly,
    Monthly,
    Never,
}

impl Default for QuotaResetCycle {
    fn default() -> Self {
        QuotaResetCycle::Never
    }
}

fn default_priority() -> u32 {
    100
}

fn default_model_patterns() -> String {
    String::new()
}

/// An upstream target identified by a `(client_kind, name)` pair.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Endpoint {
    pub name: String,
    pub client_kind: ClientKind,
    pub api_url: String,
    pub api_key: Option<String>,
    pub upstream_dialect: UpstreamDialect,
    /// Optional upstream model override; when unset the client-requested model passes through.
    pub model: Option<String>,
    pub status: EndpointStatus,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Comma-separated glob set; empty or `*` matches every model.
    #[serde(default = "default_model_patterns")]
    pub model_patterns: String,
    /// USD per million input tokens.
    pub cost_per_input_token: f64,
    /// USD per million output tokens.
    pub cost_per_output_token: f64,
    /// Tokens allowed per window; 0 = unlimited.
    pub quota_limit: u64,
    pub quota_reset_cycle: QuotaResetCycle,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            name: String::new(),
            client_kind: ClientKind::Claude,
            api_url: String::new(),
            api_key: None,
            upstream_dialect: UpstreamDialect::Claude,
            model: None,
            status: EndpointStatus::default(),
            priority: default_priority(),
            model_patterns: default_model_patterns(),
            cost_per_input_token: 0.0,
            cost_per_output_token: 0.0,
            quota_limit: 0,
            quota_reset_cycle: QuotaResetCycle::default(),
        }
    }
}

/// Proxy configuration for outbound upstream requests.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// "system", "custom", or "none"
    #[serde(rename = "type")]
    pub proxy_type: String,
    /// Only used when proxy_type is "custom". HTTP/HTTPS proxy URL; SOCKS5 URLs
    /// (`socks5://...`) are also accepted, reqwest dispatches on the scheme.
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bypass: Option<Vec<String>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_type: "system".to_string(),
            url: None,
            username: None,
            password: None,
            bypass: None,
        }
    }
}

/// Load-balance algorithm used when neither cost-priority nor session
/// affinity has already picked an endpoint.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceAlgorithm {
    Fastest,
    Weighted,
    RoundRobin,
}

impl Default for LoadBalanceAlgorithm {
    fn default() -> Self {
        LoadBalanceAlgorithm::RoundRobin
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RoutingConfig {
    pub enable_model_routing: bool,
    pub enable_quota_routing: bool,
    pub enable_cost_priority: bool,
    pub enable_load_balance: bool,
    pub load_balance_algorithm: LoadBalanceAlgorithm,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enable_model_routing: true,
            enable_quota_routing: true,
            enable_cost_priority: false,
            enable_load_balance: false,
            load_balance_algorithm: LoadBalanceAlgorithm::RoundRobin,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 1000,
        }
    }
}

/// Global/per-endpoint rolling counters plus optional spend budgets.
/// `rpm`/budgets of `None` mean "no cap".
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Global requests-per-minute cap (60s rolling window).
    pub rpm: Option<u32>,
    /// Per-endpoint requests-per-minute cap (60s rolling window).
    pub per_endpoint_rpm: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub max_concurrent_per_session: Option<u32>,
    pub budget_daily_usd: Option<f64>,
    pub budget_weekly_usd: Option<f64>,
    pub budget_monthly_usd: Option<f64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpm: None,
            per_endpoint_rpm: None,
            max_concurrent: None,
            max_concurrent_per_session: None,
            budget_daily_usd: None,
            budget_weekly_usd: None,
            budget_monthly_usd: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SessionAffinityConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_concurrent_per_endpoint: Option<u32>,
}

impl Default for SessionAffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 24 * 3600,
            max_concurrent_per_endpoint: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct HealthProberConfig {
    /// 0 disables the background prober.
    pub interval_secs: u64,
    pub consecutive_failure_threshold: u32,
    pub alert_cooldown_secs: u64,
    pub latency_alert_ms: u64,
    pub latency_increase_percent: f64,
}

impl Default for HealthProberConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            consecutive_failure_threshold: 3,
            alert_cooldown_secs: 600,
            latency_alert_ms: 5000,
            latency_increase_percent: 50.0,
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    300
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub port: u16,
    pub endpoints: Vec<Endpoint>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    pub retry_initial_ms: Option<u64>,
    pub retry_max_ms: Option<u64>,
    pub proxy: Option<ProxyConfig>,
    pub routing: RoutingConfig,
    pub cache: CacheConfig,
    pub limits: RateLimitConfig,
    pub session_affinity: SessionAffinityConfig,
    pub health_prober: HealthProberConfig,
    pub retry_max_attempts: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8787,
            endpoints: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_initial_ms: Some(200),
            retry_max_ms: Some(5000),
            proxy: None,
            routing: RoutingConfig::default(),
            cache: CacheConfig::default(),
            limits: RateLimitConfig::default(),
            session_affinity: SessionAffinityConfig::default(),
            health_prober: HealthProberConfig::default(),
            retry_max_attempts: Some(2),
        }
    }
}

fn settings_path() -> PathBuf {
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("CCNexus");
    fs::create_dir_all(&p).ok();
    p.push("settings.toml");
    p
}

fn read_from_disk() -> Settings {
    let p = settings_path();
    crate::logger::info("config", &format!("loading config from {:?}", p));
    if p.exists() {
        let s = fs::read_to_string(&p).unwrap_or_default();
        toml::from_str(&s).unwrap_or_else(|e| {
            crate::logger::error("config", &format!("failed to parse config: {e}"));
            Settings::default()
        })
    } else {
        crate::logger::info("config", "config file does not exist, using defaults");
        Settings::default()
    }
}

/// In-memory snapshot of the on-disk settings. Readers clone the inner `Arc`
/// and release the lock immediately; updates swap in a fresh `Arc` rather
/// than mutating fields in place, so a reader holding an old snapshot never
/// observes a half-written config.
static SNAPSHOT: Lazy<RwLock<Option<Arc<Settings>>>> = Lazy::new(|| RwLock::new(None));

/// Return the current config snapshot. Readers clone the `Arc` pointer, not
/// the `Settings` behind it, so a hot-path caller that only peeks at one
/// field pays a refcount bump instead of a full struct clone. Callers that
/// need an owned, mutable copy (to change a field and call [`update`]) should
/// do `(*config::load()).clone()` at that one call site.
pub fn load() -> Arc<Settings> {
    if let Some(snapshot) = SNAPSHOT.read().unwrap().as_ref() {
        return Arc::clone(snapshot);
    }
    let fresh = Arc::new(read_from_disk());
    *SNAPSHOT.write().unwrap() = Some(Arc::clone(&fresh));
    fresh
}

/// Force the next [`load`] (and every call until the next `reload`/`update`)
/// to re-read `settings.toml` from disk.
pub fn reload() {
    *SNAPSHOT.write().unwrap() = None;
}

/// Persist `cfg` to disk and atomically publish it as the new snapshot.
pub fn update(cfg: Settings) -> Result<(), String> {
    save(&cfg)?;
    *SNAPSHOT.write().unwrap() = Some(Arc::new(cfg));
    Ok(())
}

pub fn save(cfg: &Settings) -> Result<(), String> {
    let p = settings_path();
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }
    let s = toml::to_string_pretty(cfg).map_err(|e| format!("failed to serialize config: {e}"))?;
    fs::write(&p, &s).map_err(|e| format!("failed to write config file to {:?}: {e}", p))?;
    Ok(())
}

pub fn reset() -> Result<(), String> {
    let p = settings_path();
    if p.exists() {
        fs::remove_file(&p).map_err(|e| format!("failed to remove config file {:?}: {e}", p))?;
    }
    reload();
    Ok(())
}

#[cfg(target_os = "windows")]
#[allow(dead_code)]
mod platform_security {
    use std::{ffi::c_void, ptr::null_mut};
    use windows::{
        core::PCWSTR,
        Win32::{
            Foundation::{LocalFree, HLOCAL},
            Security::Cryptography::{
                CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
            },
        },
    };

    unsafe fn vec_from_blob(blob: &CRYPT_INTEGER_BLOB) -> Vec<u8> {
        if blob.pbData.is_null() || blob.cbData == 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts(blob.pbData, blob.cbData as usize).to_vec()
        }
    }

    unsafe fn blob_from_slice(slice: &[u8]) -> CRYPT_INTEGER_BLOB {
        CRYPT_INTEGER_BLOB {
            cbData: slice.len() as u32,
            pbData: slice.as_ptr() as *mut u8,
        }
    }

    fn free_blob(blob: &mut CRYPT_INTEGER_BLOB) {
        unsafe {
            if !blob.pbData.is_null() {
                let _ = LocalFree(HLOCAL(blob.pbData as *mut c_void));
                blob.pbData = null_mut();
                blob.cbData = 0;
            }
        }
    }

    /// Encrypt at-rest secrets (API keys) with the current user's DPAPI key.
    pub fn protect(data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        unsafe {
            let in_blob = blob_from_slice(data);
            let mut out_blob = CRYPT_INTEGER_BLOB {
                cbData: 0,
                pbData: null_mut(),
            };
            if CryptProtectData(
                &in_blob,
                PCWSTR::null(),
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut out_blob,
            )
            .is_err()
            {
                return data.to_vec();
            }
            let result = vec_from_blob(&out_blob);
            free_blob(&mut out_blob);
            result
        }
    }

    pub fn unprotect(data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        unsafe {
            let in_blob = blob_from_slice(data);
            let mut out_blob = CRYPT_INTEGER_BLOB {
                cbData: 0,
                pbData: null_mut(),
            };
            if CryptUnprotectData(
                &in_blob,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut out_blob,
            )
            .is_err()
            {
                return data.to_vec();
            }
            let result = vec_from_blob(&out_blob);
            free_blob(&mut out_blob);
            result
        }
    }
}

#[cfg(target_os = "windows")]
#[allow(unused_imports)]
pub use platform_security::{protect, unprotect};

#[cfg(not(target_os = "windows"))]
pub fn protect(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}
#[cfg(not(target_os = "windows"))]
pub fn unprotect(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_default_status_is_untested() {
        let e = Endpoint::default();
        assert_eq!(e.status, EndpointStatus::Untested);
        assert_eq!(e.priority, 100);
    }

    #[test]
    fn settings_round_trip_toml() {
        let mut cfg = Settings::default();
        cfg.endpoints.push(Endpoint {
            name: "primary".into(),
            client_kind: ClientKind::Claude,
            api_url: "https://api.anthropic.com".into(),
            api_key: Some("sk-test".into()),
            upstream_dialect: UpstreamDialect::Claude,
            ..Default::default()
        });
        let s = toml::to_string_pretty(&cfg).unwrap();
        let back: Settings = toml::from_str(&s).unwrap();
        assert_eq!(back.endpoints.len(), 1);
        assert_eq!(back.endpoints[0].name, "primary");
    }
}
