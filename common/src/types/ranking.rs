use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use super::chunk::{Chunk, Metadata};

/// One entry of a single source's ranking. `rank` is the 1-based position.
#[derive(Debug, Clone, Serialize)]
pub struct RankedEntry {
    #[serde(flatten)]
    pub chunk: Arc<Chunk>,
    pub score: f32,
    pub rank: usize,
}

impl RankedEntry {
    pub const fn new(chunk: Arc<Chunk>, score: f32, rank: usize) -> Self {
        Self { chunk, score, rank }
    }

    pub fn doc_id(&self) -> &str {
        &self.chunk.id
    }

    /// Assigns 1-based ranks following the order of `scored`.
    pub fn rank_in_order(scored: Vec<(Arc<Chunk>, f32)>) -> Vec<Self> {
        scored
            .into_iter()
            .enumerate()
            .map(|(index, (chunk, score))| Self::new(chunk, score, index + 1))
            .collect()
    }
}

/// A document after fusion, carrying the per-source evidence that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct FusedResult {
    #[serde(flatten)]
    pub chunk: Arc<Chunk>,
    pub final_score: f32,
    pub lexical_score: Option<f32>,
    pub vector_score: Option<f32>,
    pub lexical_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

impl FusedResult {
    pub const fn new(chunk: Arc<Chunk>) -> Self {
        Self {
            chunk,
            final_score: 0.0,
            lexical_score: None,
            vector_score: None,
            lexical_rank: None,
            vector_rank: None,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.chunk.id
    }

    pub fn content(&self) -> &str {
        &self.chunk.content
    }

    pub fn metadata(&self) -> &Metadata {
        &self.chunk.metadata
    }

    /// Similarity that fed this result before any reranking.
    pub fn original_similarity(&self) -> f32 {
        self.vector_score.unwrap_or(self.final_score)
    }
}

/// How two rankings are merged into one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    VectorOnly,
    LexicalOnly,
    RrfFusion,
    WeightedFusion,
}

impl FusionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VectorOnly => "vector_only",
            Self::LexicalOnly => "lexical_only",
            Self::RrfFusion => "rrf_fusion",
            Self::WeightedFusion => "weighted_fusion",
        }
    }
}

impl fmt::Display for FusionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FusionStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "vector_only" | "vector" => Ok(Self::VectorOnly),
            "lexical_only" | "lexical" | "bm25" => Ok(Self::LexicalOnly),
            "rrf_fusion" | "rrf" => Ok(Self::RrfFusion),
            "weighted_fusion" | "weighted" => Ok(Self::WeightedFusion),
            other => Err(format!("unknown fusion strategy '{other}'")),
        }
    }
}
