mod llm;
mod pool;

pub use llm::{parse_relevance_score, LlmRelevanceScorer};
pub use pool::{RerankerLease, RerankerPool};

use std::{cmp::Ordering, sync::Arc};

use async_trait::async_trait;
use common::{error::AppError, types::FusedResult, utils::config::RerankerSettings};
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::scoring::clamp_unit;

/// Relevance of the document at `index` in the submitted batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairScore {
    pub index: usize,
    pub score: f32,
}

/// Fast scorer that rates a query against a batch of documents in one call.
#[async_trait]
pub trait PairwiseScorer: Send + Sync {
    async fn score_pairs(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<PairScore>, AppError>;
}

/// Slow scorer that rates one document at a time on a 0 to 10 scale.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, query: &str, document: &str) -> Result<f32, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankMethod {
    CrossEncoder,
    LlmFallback,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct RerankScore {
    pub doc_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RerankOutcome {
    pub results: Vec<FusedResult>,
    /// Scores aligned with `results`.
    pub scores: Vec<RerankScore>,
    pub method: RerankMethod,
}

/// Reorders fused candidates by relevance to the query.
///
/// The pairwise scorer is tried first, then the relevance scorer. When neither is
/// configured or both fail the candidates come back in their original order.
pub struct Reranker {
    pairwise: Option<Arc<dyn PairwiseScorer>>,
    relevance: Option<Arc<dyn RelevanceScorer>>,
    llm_weight: f32,
    similarity_weight: f32,
    concurrency: usize,
}

impl Default for Reranker {
    fn default() -> Self {
        Self::new(&RerankerSettings::default())
    }
}

impl Reranker {
    pub fn new(settings: &RerankerSettings) -> Self {
        Self {
            pairwise: None,
            relevance: None,
            llm_weight: settings.llm_weight,
            similarity_weight: settings.similarity_weight,
            concurrency: settings.llm_concurrency.max(1),
        }
    }

    #[must_use]
    pub fn with_pairwise(mut self, scorer: Arc<dyn PairwiseScorer>) -> Self {
        self.pairwise = Some(scorer);
        self
    }

    #[must_use]
    pub fn with_relevance(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.relevance = Some(scorer);
        self
    }

    pub const fn is_enabled(&self) -> bool {
        self.pairwise.is_some() || self.relevance.is_some()
    }

    /// Never fails: scorer errors are logged and degrade to the next path.
    /// The whole candidate set is returned unless `top_k` is given.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<FusedResult>,
        top_k: Option<usize>,
    ) -> RerankOutcome {
        let scored = if candidates.is_empty() {
            None
        } else {
            self.try_scorers(query, &candidates).await
        };

        let (mut ordered, method) = match scored {
            Some((scores, method)) => (sort_by_scores(candidates, &scores), method),
            None => (
                candidates
                    .into_iter()
                    .map(|candidate| {
                        let score = candidate.final_score;
                        (candidate, score)
                    })
                    .collect(),
                RerankMethod::None,
            ),
        };

        if let Some(k) = top_k {
            ordered.truncate(k);
        }

        let (results, scores) = ordered
            .into_iter()
            .map(|(candidate, score)| {
                let doc_score = RerankScore {
                    doc_id: candidate.doc_id().to_owned(),
                    score,
                };
                (candidate, doc_score)
            })
            .unzip();

        RerankOutcome {
            results,
            scores,
            method,
        }
    }

    async fn try_scorers(
        &self,
        query: &str,
        candidates: &[FusedResult],
    ) -> Option<(Vec<f32>, RerankMethod)> {
        if let Some(pairwise) = &self.pairwise {
            match cross_encoder_scores(pairwise.as_ref(), query, candidates).await {
                Ok(scores) => return Some((scores, RerankMethod::CrossEncoder)),
                Err(err) => warn!(error = %err, "Cross-encoder reranking failed; trying fallback"),
            }
        }

        if let Some(relevance) = &self.relevance {
            match self.llm_scores(relevance.as_ref(), query, candidates).await {
                Ok(scores) => return Some((scores, RerankMethod::LlmFallback)),
                Err(err) => warn!(error = %err, "LLM reranking failed; keeping fused order"),
            }
        }

        if !self.is_enabled() {
            debug!("No reranker configured; keeping fused order");
        }
        None
    }

    /// `llm_weight * (score / 10) + similarity_weight * original_similarity` per candidate.
    async fn llm_scores(
        &self,
        scorer: &dyn RelevanceScorer,
        query: &str,
        candidates: &[FusedResult],
    ) -> Result<Vec<f32>, AppError> {
        let mut scored: Vec<(usize, f32)> = stream::iter(candidates.iter().enumerate())
            .map(|(index, candidate)| async move {
                let relevance = scorer.score(query, candidate.content()).await?;
                let relevance = if relevance.is_finite() {
                    relevance.clamp(0.0, 10.0)
                } else {
                    0.0
                };
                let combined = self.llm_weight * (relevance / 10.0)
                    + self.similarity_weight * clamp_unit(candidate.original_similarity());
                Ok::<_, AppError>((index, combined))
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        scored.sort_by_key(|(index, _)| *index);
        Ok(scored.into_iter().map(|(_, score)| score).collect())
    }
}

/// Scores every candidate through the pairwise scorer. A response that leaves any
/// candidate unscored counts as a failure.
async fn cross_encoder_scores(
    scorer: &dyn PairwiseScorer,
    query: &str,
    candidates: &[FusedResult],
) -> Result<Vec<f32>, AppError> {
    let documents = candidates
        .iter()
        .map(|candidate| candidate.content().to_owned())
        .collect();
    let results = scorer.score_pairs(query, documents).await?;

    let mut scores: Vec<Option<f32>> = vec![None; candidates.len()];
    for result in results {
        match scores.get_mut(result.index) {
            Some(slot) => *slot = Some(result.score),
            None => warn!(
                result_index = result.index,
                "Reranker returned out-of-range index; skipping"
            ),
        }
    }

    scores
        .into_iter()
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| AppError::InternalError("reranker left candidates unscored".to_string()))
}

/// Stable descending sort of candidates by their aligned scores.
fn sort_by_scores(candidates: Vec<FusedResult>, scores: &[f32]) -> Vec<(FusedResult, f32)> {
    let mut paired: Vec<(FusedResult, f32)> = candidates
        .into_iter()
        .zip(scores.iter().copied())
        .collect();
    paired.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    paired
}
