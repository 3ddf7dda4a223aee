use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    types::{Chunk, RankedEntry},
    utils::{embedding::EmbeddingProvider, similarity::cosine_similarity},
};
use tokio::sync::RwLock;
use tracing::debug;

/// Nearest-neighbour search over chunk embeddings.
#[async_trait]
pub trait VectorSource: Send + Sync {
    async fn search(
        &self,
        embedding: &[f32],
        k: usize,
        threshold: f32,
        scope_filter: Option<&str>,
    ) -> Result<Vec<RankedEntry>, AppError>;
}

/// Supplies the chunks of a scope, in order, for lexical indexing.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn chunks(&self, scope_id: &str) -> Result<Vec<Arc<Chunk>>, AppError>;
}

/// Brute-force cosine search over embeddings held in memory.
#[derive(Default)]
pub struct InMemoryVectorSource {
    entries: RwLock<Vec<(Arc<Chunk>, Vec<f32>)>>,
}

impl InMemoryVectorSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the embedding for `chunk`.
    pub async fn insert(&self, chunk: Arc<Chunk>, embedding: Vec<f32>) {
        let mut entries = self.entries.write().await;
        entries.retain(|(existing, _)| existing.id != chunk.id);
        entries.push((chunk, embedding));
    }

    /// Embeds every chunk with `provider` and stores the vectors.
    pub async fn index(
        &self,
        provider: &EmbeddingProvider,
        chunks: &[Arc<Chunk>],
    ) -> Result<usize, AppError> {
        let texts = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let embeddings = provider.embed_batch(texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(AppError::InternalError(format!(
                "embedding backend returned {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }

        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            self.insert(Arc::clone(chunk), embedding).await;
        }
        debug!(chunks = chunks.len(), "Indexed chunk embeddings");
        Ok(chunks.len())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl VectorSource for InMemoryVectorSource {
    async fn search(
        &self,
        embedding: &[f32],
        k: usize,
        threshold: f32,
        scope_filter: Option<&str>,
    ) -> Result<Vec<RankedEntry>, AppError> {
        let entries = self.entries.read().await;
        let mut scored: Vec<(Arc<Chunk>, f32)> = entries
            .iter()
            .filter(|(chunk, _)| scope_filter.map_or(true, |scope| chunk.scope_id == scope))
            .map(|(chunk, vector)| (Arc::clone(chunk), cosine_similarity(embedding, vector)))
            .filter(|(_, similarity)| *similarity >= threshold)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        Ok(RankedEntry::rank_in_order(scored))
    }
}

/// Chunks grouped by scope, kept in insertion order.
#[derive(Default)]
pub struct InMemoryChunkSource {
    scopes: RwLock<HashMap<String, Vec<Arc<Chunk>>>>,
}

impl InMemoryChunkSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, chunk: Arc<Chunk>) {
        self.scopes
            .write()
            .await
            .entry(chunk.scope_id.clone())
            .or_default()
            .push(chunk);
    }

    pub async fn extend(&self, chunks: impl IntoIterator<Item = Arc<Chunk>>) {
        let mut scopes = self.scopes.write().await;
        for chunk in chunks {
            scopes.entry(chunk.scope_id.clone()).or_default().push(chunk);
        }
    }
}

#[async_trait]
impl ChunkSource for InMemoryChunkSource {
    async fn chunks(&self, scope_id: &str) -> Result<Vec<Arc<Chunk>>, AppError> {
        Ok(self
            .scopes
            .read()
            .await
            .get(scope_id)
            .cloned()
            .unwrap_or_default())
    }
}
