use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use async_openai::{types::CreateEmbeddingRequestArgs, Client};
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::utils::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAI,
    FastEmbed,
    #[default]
    Hashed,
}

impl FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "hashed" => Ok(Self::Hashed),
            "fastembed" | "fast-embed" | "fast" => Ok(Self::FastEmbed),
            other => Err(anyhow!(
                "unknown embedding backend '{other}'. Expected 'openai', 'hashed', or 'fastembed'."
            )),
        }
    }
}

/// Turns query and chunk text into vectors for similarity search and cache lookup.
#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimension: usize,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: EmbeddingModel,
        dimension: usize,
    },
}

impl EmbeddingProvider {
    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } | EmbeddingInner::FastEmbed { dimension, .. } => {
                *dimension
            }
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    pub fn model_code(&self) -> Option<String> {
        match &self.inner {
            EmbeddingInner::FastEmbed { model_name, .. } => Some(model_name.to_string()),
            EmbeddingInner::OpenAI { model, .. } => Some(model.clone()),
            EmbeddingInner::Hashed { .. } => None,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(hashed_embedding(text, *dimension)),
            EmbeddingInner::FastEmbed { model, .. } => {
                let mut guard = model.lock().await;
                let embeddings = guard
                    .embed(vec![text.to_owned()], None)
                    .context("generating fastembed vector")?;
                embeddings
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("fastembed returned no embedding for input"))
            }
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input([text])
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                let embedding = response
                    .data
                    .first()
                    .ok_or_else(|| anyhow!("No embedding data received from OpenAI API"))?
                    .embedding
                    .clone();

                debug!(dimensions = embedding.len(), "Received OpenAI embedding");
                Ok(embedding)
            }
        }
    }

    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(texts
                .into_iter()
                .map(|text| hashed_embedding(&text, *dimension))
                .collect()),
            EmbeddingInner::FastEmbed { model, .. } => {
                if texts.is_empty() {
                    return Ok(Vec::new());
                }
                let mut guard = model.lock().await;
                guard
                    .embed(texts, None)
                    .context("generating fastembed batch embeddings")
            }
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                if texts.is_empty() {
                    return Ok(Vec::new());
                }

                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input(texts)
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                Ok(response
                    .data
                    .into_iter()
                    .map(|item| item.embedding)
                    .collect())
            }
        }
    }

    /// Builds the backend selected in configuration.
    ///
    /// The OpenAI backend reuses `openai_client` when given, otherwise a client is
    /// created from `openai_api_key` / `openai_base_url`.
    pub async fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<Client<async_openai::config::OpenAIConfig>>>,
    ) -> Result<Self> {
        match config.embedding_backend {
            EmbeddingBackend::Hashed => Self::new_hashed(config.embedding_dimensions as usize),
            EmbeddingBackend::OpenAI => {
                let client = openai_client.unwrap_or_else(|| {
                    Arc::new(Client::with_config(
                        async_openai::config::OpenAIConfig::new()
                            .with_api_key(&config.openai_api_key)
                            .with_api_base(&config.openai_base_url),
                    ))
                });
                let model = config
                    .embedding_model
                    .clone()
                    .unwrap_or_else(|| "text-embedding-3-small".to_string());
                Self::new_openai(client, model, config.embedding_dimensions)
            }
            EmbeddingBackend::FastEmbed => {
                let cache_dir = config
                    .fastembed_cache_dir
                    .as_ref()
                    .map_or_else(|| Path::new(&config.data_dir).join("fastembed"), PathBuf::from);
                Self::new_fastembed(
                    config.embedding_model.clone(),
                    cache_dir,
                    config.fastembed_show_download_progress.unwrap_or(true),
                )
                .await
            }
        }
    }

    pub fn new_openai(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Result<Self> {
        if dimensions == 0 {
            return Err(anyhow!("OpenAI embedding dimensions must be greater than zero"));
        }
        Ok(Self {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
        })
    }

    pub async fn new_fastembed(
        model_override: Option<String>,
        cache_dir: PathBuf,
        show_download_progress: bool,
    ) -> Result<Self> {
        let model_name = if let Some(code) = model_override {
            EmbeddingModel::from_str(&code).map_err(|err| anyhow!(err))?
        } else {
            EmbeddingModel::default()
        };

        let options = TextInitOptions::new(model_name.clone())
            .with_cache_dir(cache_dir)
            .with_show_download_progress(show_download_progress);
        let model_name_for_task = model_name.clone();
        let model_name_code = model_name.to_string();

        let (model, dimension) = tokio::task::spawn_blocking(move || -> Result<_> {
            let model =
                TextEmbedding::try_new(options).context("initialising FastEmbed text model")?;
            let info = EmbeddingModel::get_model_info(&model_name_for_task)
                .ok_or_else(|| anyhow!("FastEmbed model metadata missing for {model_name_code}"))?;
            Ok((model, info.dim))
        })
        .await
        .context("joining FastEmbed initialisation task")??;

        Ok(Self {
            inner: EmbeddingInner::FastEmbed {
                model: Arc::new(Mutex::new(model)),
                model_name,
                dimension,
            },
        })
    }

    pub fn new_hashed(dimension: usize) -> Result<Self> {
        Ok(Self {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        })
    }
}

// Helper functions for hashed embeddings
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    let mut token_count = 0f32;
    for token in tokens(text) {
        token_count += 1.0;
        if let Some(slot) = vector.get_mut(bucket(&token, dim)) {
            *slot += 1.0;
        }
    }

    if token_count == 0.0 {
        return vector;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_ascii_lowercase)
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    usize::try_from(hasher.finish() % dimension as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::similarity::cosine_similarity;

    #[tokio::test]
    async fn hashed_embeddings_are_deterministic_and_normalized() {
        let provider = EmbeddingProvider::new_hashed(64).expect("hashed provider");
        let first = provider.embed("Tokio runtime scheduling").await.expect("embed");
        let second = provider.embed("tokio RUNTIME scheduling").await.expect("embed");

        assert_eq!(first.len(), 64);
        assert_eq!(first, second);
        let norm = first.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hashed_embeddings_separate_unrelated_text() {
        let provider = EmbeddingProvider::new_hashed(256).expect("hashed provider");
        let batch = provider
            .embed_batch(vec![
                "rust async runtime".into(),
                "rust async runtime tokio".into(),
                "banana bread recipe".into(),
            ])
            .await
            .expect("batch");

        let related = cosine_similarity(&batch[0], &batch[1]);
        let unrelated = cosine_similarity(&batch[0], &batch[2]);
        assert!(related > unrelated);
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let provider = EmbeddingProvider::new_hashed(8).expect("hashed provider");
        let vector = provider.embed("").await.expect("embed");
        assert!(vector.iter().all(|v| *v == 0.0));
        assert_eq!(provider.backend_label(), "hashed");
        assert!(provider.model_code().is_none());
    }

    #[test]
    fn backend_parses_aliases() {
        assert_eq!(
            "fast-embed".parse::<EmbeddingBackend>().expect("parse"),
            EmbeddingBackend::FastEmbed
        );
        assert!("word2vec".parse::<EmbeddingBackend>().is_err());
    }

    #[tokio::test]
    async fn from_config_defaults_to_hashed() {
        let config = AppConfig::default();
        let provider = EmbeddingProvider::from_config(&config, None)
            .await
            .expect("provider");
        assert_eq!(provider.backend_label(), "hashed");
        assert_eq!(provider.dimension(), config.embedding_dimensions as usize);
    }
}
