use std::time::Duration;

use common::utils::config::{AppConfig, RetrievalTuning};

/// Request-level knobs for [`super::RetrievalService`].
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub tuning: RetrievalTuning,
    /// Providers tried per fallback chain. `0` tries the whole chain.
    pub max_attempts: usize,
    /// Per-call provider timeout.
    pub provider_timeout: Duration,
    pub rerank_enabled: bool,
    /// Rerank keeps the full candidate set unless this is set.
    pub rerank_top_k: Option<usize>,
    pub cache_ttl_seconds: Option<u64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl RetrievalConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            tuning: config.retrieval.clone(),
            max_attempts: config.fallback.max_attempts,
            provider_timeout: config.fallback.timeout(),
            rerank_enabled: true,
            rerank_top_k: None,
            cache_ttl_seconds: None,
        }
    }

    #[must_use]
    pub const fn with_rerank(mut self, enabled: bool) -> Self {
        self.rerank_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_rerank_top_k(mut self, top_k: Option<usize>) -> Self {
        self.rerank_top_k = top_k;
        self
    }
}
