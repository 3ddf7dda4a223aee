use std::{collections::HashMap, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::{error::FailureReason, types::FusionStrategy, utils::embedding::EmbeddingBackend};

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default)]
    pub fastembed_cache_dir: Option<String>,
    #[serde(default)]
    pub fastembed_show_download_progress: Option<bool>,
    #[serde(default)]
    pub fastembed_max_length: Option<usize>,
    #[serde(default)]
    pub retrieval: RetrievalTuning,
    #[serde(default)]
    pub reranking: RerankerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub fallback: FallbackSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_base_url: default_base_url(),
            data_dir: default_data_dir(),
            embedding_backend: EmbeddingBackend::default(),
            embedding_model: None,
            embedding_dimensions: default_embedding_dimensions(),
            fastembed_cache_dir: None,
            fastembed_show_download_progress: None,
            fastembed_max_length: None,
            retrieval: RetrievalTuning::default(),
            reranking: RerankerSettings::default(),
            cache: CacheSettings::default(),
            fallback: FallbackSettings::default(),
        }
    }
}

/// Tunable parameters for lexical search, vector search and fusion.
#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct RetrievalTuning {
    /// Reciprocal rank fusion smoothing constant.
    pub rrf_k: f32,
    pub vector_weight: f32,
    pub lexical_weight: f32,
    pub lexical_take: usize,
    pub vector_take: usize,
    pub vector_threshold: f32,
    pub lexical_min_score: f32,
    /// Forces a fusion strategy instead of picking one from input availability.
    pub fusion_strategy: Option<FusionStrategy>,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            vector_weight: 0.7,
            lexical_weight: 0.3,
            lexical_take: 20,
            vector_take: 20,
            vector_threshold: 0.0,
            lexical_min_score: 0.0,
            fusion_strategy: None,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct RerankerSettings {
    /// Enables the cross-encoder pool.
    pub enabled: bool,
    pub pool_size: Option<usize>,
    /// Enables the slower LLM relevance scorer used when the cross-encoder is unavailable.
    pub llm_fallback_enabled: bool,
    pub llm_weight: f32,
    pub similarity_weight: f32,
    pub llm_concurrency: usize,
}

impl Default for RerankerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            pool_size: None,
            llm_fallback_enabled: false,
            llm_weight: 0.7,
            similarity_weight: 0.3,
            llm_concurrency: 4,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub similarity_threshold: f32,
    pub max_entries_per_scope: usize,
    pub max_total_entries: usize,
    pub default_ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.95,
            max_entries_per_scope: 100,
            max_total_entries: 1000,
            default_ttl_seconds: 3600,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct FallbackSettings {
    pub max_attempts: usize,
    pub timeout_seconds: u64,
    pub max_backoff_exponent: u32,
    pub cooldowns: CooldownSettings,
    /// Category name to ordered provider ids.
    pub chains: HashMap<String, Vec<String>>,
    pub providers: HashMap<String, ProviderEndpoint>,
}

impl FallbackSettings {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_seconds: 60,
            max_backoff_exponent: 5,
            cooldowns: CooldownSettings::default(),
            chains: default_chains(),
            providers: default_providers(),
        }
    }
}

/// Base cooldown per failure reason, before exponential growth.
#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct CooldownSettings {
    pub rate_limit_seconds: u64,
    pub timeout_seconds: u64,
    pub api_error_seconds: u64,
    pub invalid_response_seconds: u64,
}

impl CooldownSettings {
    pub const fn base_for(&self, reason: FailureReason) -> Duration {
        let seconds = match reason {
            FailureReason::RateLimit => self.rate_limit_seconds,
            FailureReason::Timeout => self.timeout_seconds,
            FailureReason::ApiError => self.api_error_seconds,
            FailureReason::InvalidResponse => self.invalid_response_seconds,
        };
        Duration::from_secs(seconds)
    }
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            rate_limit_seconds: 120,
            timeout_seconds: 60,
            api_error_seconds: 30,
            invalid_response_seconds: 10,
        }
    }
}

/// An OpenAI-compatible chat endpoint addressable by provider id.
#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key. Falls back to `openai_api_key`.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

const fn default_embedding_dimensions() -> u32 {
    384
}

fn default_chains() -> HashMap<String, Vec<String>> {
    HashMap::from([
        (
            "generation".to_string(),
            vec![
                "openai".to_string(),
                "openrouter".to_string(),
                "ollama".to_string(),
            ],
        ),
        (
            "reranking".to_string(),
            vec!["openai".to_string(), "ollama".to_string()],
        ),
    ])
}

fn default_providers() -> HashMap<String, ProviderEndpoint> {
    HashMap::from([
        (
            "openai".to_string(),
            ProviderEndpoint {
                base_url: default_base_url(),
                model: "gpt-4o-mini".to_string(),
                api_key_env: Some("OPENAI_API_KEY".to_string()),
            },
        ),
        (
            "openrouter".to_string(),
            ProviderEndpoint {
                base_url: "https://openrouter.ai/api/v1".to_string(),
                model: "openai/gpt-4o-mini".to_string(),
                api_key_env: Some("OPENROUTER_API_KEY".to_string()),
            },
        ),
        (
            "ollama".to_string(),
            ProviderEndpoint {
                base_url: "http://localhost:11434/v1".to_string(),
                model: "llama3.1".to_string(),
                api_key_env: None,
            },
        ),
    ])
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::default()
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("fallback.chains.generation")
                .with_list_parse_key("fallback.chains.reranking"),
        )
        .build()?;

    config.try_deserialize()
}
