use crate::authority::SessionAuthority;
use crate::core::config::CollectorConfig;
use std::sync::Arc;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub authority: Arc<SessionAuthority>,
    /// File-based config loaded from `inline-collector.json` (env-var fallback for all fields).
    pub config: Arc<CollectorConfig>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("store_dir", &self.config.authority.resolve_store_dir())
            .finish()
    }
}

impl AppState {
    pub fn new(authority: Arc<SessionAuthority>) -> Self {
        Self {
            authority,
            config: Arc::new(CollectorConfig::default()),
        }
    }

    pub fn with_config(mut self, config: Arc<CollectorConfig>) -> Self {
        self.config = config;
        self
    }
}
