use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::error::{AppError, ProviderError};
use serde::Deserialize;
use serde_json::json;

use crate::{
    providers::{ProviderPayload, ResponseSchema, ScoringProvider},
    resilience::FallbackExecutor,
};

use super::RelevanceScorer;

pub const RERANKING_CATEGORY: &str = "reranking";

const RELEVANCE_SYSTEM_PROMPT: &str = "You rate how relevant a document is to a search query. \
Reply with a JSON object containing a single integer field `score` from 0 (unrelated) to 10 \
(directly answers the query).";

/// Longest document excerpt sent for scoring, in characters.
const MAX_DOCUMENT_CHARS: usize = 2_000;

#[derive(Debug, Deserialize)]
struct RelevanceResponse {
    score: f32,
}

fn relevance_schema() -> ResponseSchema {
    ResponseSchema {
        name: "relevance_score".into(),
        description: Some("Relevance of a document to a query".into()),
        schema: json!({
            "type": "object",
            "properties": {
                "score": { "type": "number", "minimum": 0, "maximum": 10 }
            },
            "required": ["score"],
            "additionalProperties": false
        }),
    }
}

/// Reads `{"score": n}` or a bare number from a provider response.
pub fn parse_relevance_score(raw: &str) -> Result<f32, ProviderError> {
    let trimmed = raw.trim();
    let score = serde_json::from_str::<RelevanceResponse>(trimmed)
        .map(|response| response.score)
        .or_else(|_| trimmed.parse::<f32>())
        .map_err(|_| ProviderError::invalid_response(format!("unparseable relevance score: {trimmed}")))?;

    if score.is_finite() {
        Ok(score.clamp(0.0, 10.0))
    } else {
        Err(ProviderError::invalid_response("relevance score is not finite"))
    }
}

/// Relevance scorer that asks a chat model through the `reranking` provider chain.
pub struct LlmRelevanceScorer {
    provider: Arc<dyn ScoringProvider>,
    executor: Arc<FallbackExecutor>,
    max_attempts: usize,
    timeout: Duration,
}

impl LlmRelevanceScorer {
    pub const fn new(
        provider: Arc<dyn ScoringProvider>,
        executor: Arc<FallbackExecutor>,
        max_attempts: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            executor,
            max_attempts,
            timeout,
        }
    }
}

fn relevance_message(query: &str, document: &str) -> String {
    let excerpt: String = document.chars().take(MAX_DOCUMENT_CHARS).collect();
    format!(
        r"
        Query:
        ==================
        {query}

        Document:
        ==================
        {excerpt}
        "
    )
}

#[async_trait]
impl RelevanceScorer for LlmRelevanceScorer {
    async fn score(&self, query: &str, document: &str) -> Result<f32, AppError> {
        let payload = Arc::new(
            ProviderPayload::new(RELEVANCE_SYSTEM_PROMPT, relevance_message(query, document))
                .with_schema(relevance_schema()),
        );

        self.executor
            .execute(
                RERANKING_CATEGORY,
                |provider_id| {
                    let provider = Arc::clone(&self.provider);
                    let payload = Arc::clone(&payload);
                    async move {
                        let raw = provider.invoke(&provider_id, &payload).await?;
                        Ok::<_, AppError>(parse_relevance_score(&raw)?)
                    }
                },
                None,
                self.max_attempts,
                self.timeout,
            )
            .await?
            .into_result()
    }
}
