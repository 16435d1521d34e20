use crate::agent::roles::SiteDefinition;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// CollectorConfig: file-based config loader (inline-collector.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "INLINE_COLLECTOR_CONFIG";
pub const ENV_PORT: &str = "INLINE_COLLECTOR_PORT";
pub const ENV_STORE_DIR: &str = "INLINE_STORE_DIR";
pub const ENV_SESSION_TTL_SECS: &str = "INLINE_SESSION_TTL_SECS";
pub const ENV_AUTHORITY_URL: &str = "INLINE_AUTHORITY_URL";
pub const ENV_COLLECT_LIMIT: &str = "INLINE_COLLECT_LIMIT";

pub const DEFAULT_PORT: u16 = 5170;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Session authority settings (mirrors the `authority` key in inline-collector.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthorityConfig {
    /// Listen port. `--port` on the command line wins over this.
    pub port: Option<u16>,
    /// Directory holding one JSON file per session record / owner pointer.
    pub store_dir: Option<String>,
    /// Sessions idle longer than this are evicted. `0` disables eviction.
    pub session_ttl_secs: Option<u64>,
    /// How often the eviction sweep runs.
    pub sweep_interval_secs: Option<u64>,
}

impl AuthorityConfig {
    /// Port: JSON field → `INLINE_COLLECTOR_PORT` → `PORT` → 5170.
    pub fn resolve_port(&self) -> u16 {
        if let Some(p) = self.port {
            return p;
        }
        env_parse(ENV_PORT)
            .or_else(|| env_parse("PORT"))
            .unwrap_or(DEFAULT_PORT)
    }

    /// Store directory: JSON field → `INLINE_STORE_DIR` → `~/.inline-collector/store`.
    pub fn resolve_store_dir(&self) -> PathBuf {
        if let Some(d) = self.store_dir.as_deref().filter(|d| !d.trim().is_empty()) {
            return PathBuf::from(d);
        }
        if let Some(d) = env_string(ENV_STORE_DIR) {
            return PathBuf::from(d);
        }
        dirs::home_dir()
            .map(|h| h.join(".inline-collector").join("store"))
            .unwrap_or_else(|| PathBuf::from(".inline-collector-store"))
    }

    /// Staleness TTL: JSON field → `INLINE_SESSION_TTL_SECS` → 24 h. `None` when disabled.
    pub fn resolve_session_ttl(&self) -> Option<Duration> {
        let secs = self
            .session_ttl_secs
            .or_else(|| env_parse(ENV_SESSION_TTL_SECS))
            .unwrap_or(86_400);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn resolve_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.unwrap_or(300).max(1))
    }
}

/// Page agent settings (mirrors the `agent` key).
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub authority_url: Option<String>,
    /// Upper bound on cards collected per session. `0` or absent means every card.
    pub collect_limit: Option<usize>,
    pub detail_ready_timeout_ms: Option<u64>,
    pub card_wait_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub rpc_retries: Option<u32>,
    pub rpc_retry_delay_ms: Option<u64>,
    pub rpc_timeout_secs: Option<u64>,
    /// Pause before advancing past an item that could not be opened.
    pub skip_delay_ms: Option<u64>,
    /// `[min, max]` jitter before clicking a card, in ms.
    pub human_delay_ms: Option<[u64; 2]>,
}

impl AgentConfig {
    /// Authority URL: JSON field → `INLINE_AUTHORITY_URL` → `http://127.0.0.1:5170`.
    pub fn resolve_authority_url(&self) -> String {
        if let Some(u) = self.authority_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return u.trim_end_matches('/').to_string();
        }
        env_string(ENV_AUTHORITY_URL)
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", DEFAULT_PORT))
    }

    pub fn resolve_collect_limit(&self) -> Option<usize> {
        self.collect_limit
            .or_else(|| env_parse(ENV_COLLECT_LIMIT))
            .filter(|n| *n > 0)
    }

    pub fn resolve_settings(&self) -> AgentSettings {
        let defaults = AgentSettings::default();
        let [min, max] = self.human_delay_ms.unwrap_or(defaults.human_delay_ms);
        AgentSettings {
            collect_limit: self.resolve_collect_limit(),
            detail_ready_timeout: self
                .detail_ready_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.detail_ready_timeout),
            card_wait_timeout: self
                .card_wait_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.card_wait_timeout),
            poll_interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            skip_delay: self
                .skip_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.skip_delay),
            human_delay_ms: [min.min(max), max.max(min)],
        }
    }

    pub fn resolve_rpc(&self) -> RpcSettings {
        let defaults = RpcSettings::default();
        RpcSettings {
            retries: self.rpc_retries.unwrap_or(defaults.retries),
            retry_delay: self
                .rpc_retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            timeout: self
                .rpc_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }
}

/// Resolved agent timings.
#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub collect_limit: Option<usize>,
    pub detail_ready_timeout: Duration,
    pub card_wait_timeout: Duration,
    pub poll_interval: Duration,
    pub skip_delay: Duration,
    pub human_delay_ms: [u64; 2],
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            collect_limit: None,
            detail_ready_timeout: Duration::from_millis(5000),
            card_wait_timeout: Duration::from_millis(6000),
            poll_interval: Duration::from_millis(120),
            skip_delay: Duration::from_millis(500),
            human_delay_ms: [300, 900],
        }
    }
}

/// Resolved transport policy: retry once on "no responder", short fixed delay.
#[derive(Clone, Debug)]
pub struct RpcSettings {
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            retries: 1,
            retry_delay: Duration::from_millis(120),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Top-level config loaded from `inline-collector.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CollectorConfig {
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Replaces the built-in site table when present.
    #[serde(default)]
    pub sites: Option<Vec<SiteDefinition>>,
}

impl CollectorConfig {
    pub fn resolve_sites(&self) -> Vec<SiteDefinition> {
        match &self.sites {
            Some(sites) if !sites.is_empty() => sites.clone(),
            _ => SiteDefinition::builtin(),
        }
    }
}

/// Load `inline-collector.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `INLINE_COLLECTOR_CONFIG` env var path
/// 2. `./inline-collector.json`
/// 3. `../inline-collector.json`
///
/// Missing file → `CollectorConfig::default()` (env-var fallbacks apply).
/// Parse error → log a warning, return `CollectorConfig::default()`.
pub fn load_collector_config() -> CollectorConfig {
    let mut candidates = vec![
        PathBuf::from("inline-collector.json"),
        PathBuf::from("../inline-collector.json"),
    ];
    if let Some(env_path) = env_string(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        return match serde_json::from_str::<CollectorConfig>(&contents) {
            Ok(cfg) => {
                tracing::info!("inline-collector.json loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                tracing::warn!(
                    "inline-collector.json parse error at {}: {}; using defaults",
                    path.display(),
                    e
                );
                CollectorConfig::default()
            }
        };
    }

    CollectorConfig::default()
}
