mod config;

pub use config::RetrievalConfig;

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use async_openai::{config::OpenAIConfig, Client};
use common::{
    error::AppError,
    types::{FusedResult, FusionStrategy},
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use serde::Serialize;
use serde_json::Value;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    answer_retrieval::{generation_payload, process_llm_response, Answer, GENERATION_CATEGORY},
    cache::{CacheLookup, SemanticCache},
    lexical::LexicalIndex,
    providers::{OpenAiScoringProvider, ScoringProvider},
    reranking::{LlmRelevanceScorer, RerankMethod, RerankOutcome, Reranker, RerankerPool},
    resilience::{FallbackExecutor, FallbackResult, ProviderHealthRegistry, ProviderStatus, RetryPolicy},
    scoring::{FusionConfig, FusionEngine},
    sources::{ChunkSource, VectorSource},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Embed,
    CacheLookup,
    Retrieve,
    Rerank,
    Generate,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: StageKind,
    pub elapsed_ms: u64,
}

// Pipeline stage timings tracker
#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<StageTiming> {
        self.timings
            .into_iter()
            .map(|(stage, duration)| StageTiming {
                stage,
                elapsed_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub scope_id: String,
    pub documents: usize,
    pub lexical_indexed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<FusedResult>,
    pub lexical_count: usize,
    pub vector_count: usize,
    /// Size of the fused list before truncation to `k`.
    pub fused_count: usize,
    pub strategy: FusionStrategy,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    pub answer: Answer,
    pub cached: bool,
    pub cache_similarity: f32,
    pub sources: Vec<FusedResult>,
    pub strategy: Option<FusionStrategy>,
    pub rerank_method: RerankMethod,
    pub provider_used: Option<String>,
    pub used_fallback: bool,
    pub attempts: usize,
    pub stage_timings: Vec<StageTiming>,
}

/// Everything the service is wired from. Built once at process start.
pub struct RetrievalComponents {
    pub lexical: Arc<LexicalIndex>,
    pub vectors: Arc<dyn VectorSource>,
    pub chunks: Arc<dyn ChunkSource>,
    pub embeddings: Arc<EmbeddingProvider>,
    pub generator: Arc<dyn ScoringProvider>,
    pub reranker: Arc<Reranker>,
    pub cache: Arc<SemanticCache>,
    pub executor: Arc<FallbackExecutor>,
}

impl RetrievalComponents {
    /// Wires the default components from configuration around the given sources.
    pub async fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<Client<OpenAIConfig>>>,
        vectors: Arc<dyn VectorSource>,
        chunks: Arc<dyn ChunkSource>,
    ) -> Result<Self, AppError> {
        let embeddings = EmbeddingProvider::from_config(config, openai_client)
            .await
            .map_err(|e| AppError::InternalError(format!("Failed to build embedding provider: {e}")))?;
        info!(
            embedding_backend = embeddings.backend_label(),
            embedding_dimension = embeddings.dimension(),
            "Embedding provider initialised"
        );

        let registry = Arc::new(ProviderHealthRegistry::new(RetryPolicy::from_settings(
            &config.fallback,
        )));
        let executor = Arc::new(FallbackExecutor::new(
            registry,
            config.fallback.chains.clone(),
        ));
        let generator: Arc<dyn ScoringProvider> =
            Arc::new(OpenAiScoringProvider::from_config(config));

        let mut reranker = Reranker::new(&config.reranking);
        if let Some(pool) = RerankerPool::maybe_from_config(config)? {
            reranker = reranker.with_pairwise(Arc::new(pool));
        }
        if config.reranking.llm_fallback_enabled {
            reranker = reranker.with_relevance(Arc::new(LlmRelevanceScorer::new(
                Arc::clone(&generator),
                Arc::clone(&executor),
                config.fallback.max_attempts,
                config.fallback.timeout(),
            )));
        }

        Ok(Self {
            lexical: Arc::new(LexicalIndex::new()),
            vectors,
            chunks,
            embeddings: Arc::new(embeddings),
            generator,
            reranker: Arc::new(reranker),
            cache: Arc::new(SemanticCache::new(config.cache.clone())),
            executor,
        })
    }
}

/// Hybrid retrieval front door: lexical and vector search, fusion, reranking,
/// semantic caching and generation through provider fallback chains.
pub struct RetrievalService {
    components: RetrievalComponents,
    fusion: FusionEngine,
    config: RetrievalConfig,
}

impl RetrievalService {
    pub fn new(components: RetrievalComponents, config: RetrievalConfig) -> Self {
        Self {
            fusion: FusionEngine::new(FusionConfig::from(&config.tuning)),
            components,
            config,
        }
    }

    pub const fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub const fn components(&self) -> &RetrievalComponents {
        &self.components
    }

    /// (Re)builds the lexical index for `scope_id` from the chunk source.
    #[instrument(skip_all, fields(scope_id = %scope_id))]
    pub async fn index_scope(&self, scope_id: &str, force: bool) -> Result<IndexReport, AppError> {
        let chunks = self.components.chunks.chunks(scope_id).await?;
        let lexical_indexed = self
            .components
            .lexical
            .build(scope_id, &chunks, force)
            .await;
        if !lexical_indexed {
            debug!(scope_id, "Scope has no lexical index; searches fall back to vectors");
        }

        Ok(IndexReport {
            scope_id: scope_id.to_owned(),
            documents: chunks.len(),
            lexical_indexed,
        })
    }

    #[instrument(level = "trace", skip_all)]
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, AppError> {
        let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        let embeddings = &self.components.embeddings;

        Retry::spawn(retry_strategy, || embeddings.embed(query))
            .await
            .map_err(|e| {
                AppError::InternalError(format!("Failed to generate embedding with provider: {e}"))
            })
    }

    pub async fn search(
        &self,
        query: &str,
        scope_id: &str,
        k: usize,
    ) -> Result<SearchResponse, AppError> {
        let embedding = self.embed_query(query).await?;
        self.search_with_embedding(query, &embedding, scope_id, k)
            .await
    }

    /// Runs lexical and vector search concurrently and fuses the two rankings.
    ///
    /// The scope's lexical index is brought up to date with the chunk source first.
    /// A failing or empty source is not an error: fusion degrades to the other one.
    #[instrument(skip_all, fields(scope_id = %scope_id, k))]
    pub async fn search_with_embedding(
        &self,
        query: &str,
        embedding: &[f32],
        scope_id: &str,
        k: usize,
    ) -> Result<SearchResponse, AppError> {
        if k == 0 {
            return Err(AppError::Validation("k must be greater than zero".into()));
        }

        // Rebuilds only when the scope's chunk count changed since the last build.
        if let Err(err) = self.index_scope(scope_id, false).await {
            warn!(scope_id, error = %err, "Lexical indexing failed; continuing with vectors only");
        }

        let tuning = &self.config.tuning;
        let lexical_search = async {
            self.components.lexical.search(
                scope_id,
                query,
                tuning.lexical_take.max(k),
                tuning.lexical_min_score,
            )
        };
        let vector_search = self.components.vectors.search(
            embedding,
            tuning.vector_take.max(k),
            tuning.vector_threshold,
            Some(scope_id),
        );
        let (lexical, vector) = futures::join!(lexical_search, vector_search);

        let vector = vector.unwrap_or_else(|err| {
            warn!(scope_id, error = %err, "Vector search failed; continuing with lexical only");
            Vec::new()
        });

        debug!(
            lexical = lexical.len(),
            vector = vector.len(),
            "Hybrid retrieval candidate counts"
        );

        let outcome = self.fusion.fuse(&lexical, &vector, None);
        let fused_count = outcome.results.len();
        let mut results = outcome.results;
        results.truncate(k);

        Ok(SearchResponse {
            results,
            lexical_count: lexical.len(),
            vector_count: vector.len(),
            fused_count,
            strategy: outcome.strategy,
        })
    }

    pub async fn rerank(
        &self,
        query: &str,
        results: Vec<FusedResult>,
        top_k: Option<usize>,
    ) -> RerankOutcome {
        self.components.reranker.rerank(query, results, top_k).await
    }

    pub async fn cache_lookup(&self, embedding: &[f32], scope_id: &str) -> CacheLookup {
        self.components.cache.lookup(embedding, scope_id).await
    }

    pub async fn cache_store(
        &self,
        query: &str,
        embedding: Vec<f32>,
        response: Value,
        scope_id: &str,
        ttl_seconds: Option<u64>,
    ) -> bool {
        self.components
            .cache
            .store(query, embedding, response, scope_id, ttl_seconds)
            .await
    }

    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        category: &str,
        operation: F,
        primary: Option<&str>,
        max_attempts: usize,
        timeout: Duration,
    ) -> Result<FallbackResult<T>, AppError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.components
            .executor
            .execute(category, operation, primary, max_attempts, timeout)
            .await
    }

    pub fn get_health_status(&self) -> Vec<ProviderStatus> {
        self.components.executor.registry().status()
    }

    /// Answers `query` from the chunks of `scope_id`.
    ///
    /// A semantically equivalent earlier question in the same scope is served from the
    /// cache. Otherwise the fused and reranked results become the context of a
    /// generation request sent through the `generation` provider chain.
    #[instrument(skip_all, fields(scope_id = %scope_id))]
    pub async fn answer(
        &self,
        query: &str,
        scope_id: &str,
        k: usize,
    ) -> Result<AnswerResponse, AppError> {
        let mut timings = PipelineStageTimings::default();

        let started = Instant::now();
        let embedding = self.embed_query(query).await?;
        timings.record(StageKind::Embed, started.elapsed());

        let started = Instant::now();
        let lookup = self.cache_lookup(&embedding, scope_id).await;
        timings.record(StageKind::CacheLookup, started.elapsed());

        if let Some(entry) = lookup.entry.filter(|_| lookup.found) {
            match serde_json::from_value::<Answer>(entry.response) {
                Ok(answer) => {
                    info!(
                        similarity = lookup.similarity,
                        age_seconds = lookup.age_seconds,
                        "Serving answer from semantic cache"
                    );
                    return Ok(AnswerResponse {
                        answer,
                        cached: true,
                        cache_similarity: lookup.similarity,
                        sources: Vec::new(),
                        strategy: None,
                        rerank_method: RerankMethod::None,
                        provider_used: None,
                        used_fallback: false,
                        attempts: 0,
                        stage_timings: timings.into_vec(),
                    });
                }
                Err(err) => warn!(error = %err, "Cached response is not an answer; regenerating"),
            }
        }

        let started = Instant::now();
        let search = self
            .search_with_embedding(query, &embedding, scope_id, k)
            .await?;
        timings.record(StageKind::Retrieve, started.elapsed());

        let started = Instant::now();
        let (sources, rerank_method) = if self.config.rerank_enabled {
            let outcome = self
                .rerank(query, search.results, self.config.rerank_top_k)
                .await;
            (outcome.results, outcome.method)
        } else {
            (search.results, RerankMethod::None)
        };
        timings.record(StageKind::Rerank, started.elapsed());

        let started = Instant::now();
        let payload = Arc::new(generation_payload(query, &sources));
        let generator = &self.components.generator;
        let generation = self
            .execute_with_fallback(
                GENERATION_CATEGORY,
                |provider_id| {
                    let generator = Arc::clone(generator);
                    let payload = Arc::clone(&payload);
                    async move {
                        let raw = generator.invoke(&provider_id, &payload).await?;
                        Ok::<_, AppError>(process_llm_response(&raw)?)
                    }
                },
                None,
                self.config.max_attempts,
                self.config.provider_timeout,
            )
            .await?;
        timings.record(StageKind::Generate, started.elapsed());

        let provider_used = generation.provider_used.clone();
        let used_fallback = generation.used_fallback;
        let attempts = generation.attempts;
        let answer = generation.into_result()?;

        match serde_json::to_value(&answer) {
            Ok(value) => {
                self.cache_store(
                    query,
                    embedding,
                    value,
                    scope_id,
                    self.config.cache_ttl_seconds,
                )
                .await;
            }
            Err(err) => warn!(error = %err, "Failed to serialize answer for caching"),
        }

        Ok(AnswerResponse {
            answer,
            cached: false,
            cache_similarity: lookup.similarity,
            sources,
            strategy: Some(search.strategy),
            rerank_method,
            provider_used,
            used_fallback,
            attempts,
            stage_timings: timings.into_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        answer_retrieval::ANSWER_SYSTEM_PROMPT,
        providers::ProviderPayload,
        reranking::RelevanceScorer,
        sources::{InMemoryChunkSource, InMemoryVectorSource},
    };
    use async_trait::async_trait;
    use common::{
        error::{FailureReason, ProviderError},
        types::{Chunk, RankedEntry},
        utils::config::CacheSettings,
    };
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    const SCOPE: &str = "session-1";

    /// Generation backend scripted per provider id.
    struct ScriptedGenerator {
        responses: HashMap<&'static str, Result<String, ProviderError>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<(&'static str, Result<String, ProviderError>)>) -> Self {
            Self {
                responses: responses.into_iter().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ScoringProvider for ScriptedGenerator {
        async fn invoke(
            &self,
            provider_id: &str,
            payload: &ProviderPayload,
        ) -> Result<String, ProviderError> {
            assert_eq!(payload.system_prompt, ANSWER_SYSTEM_PROMPT);
            self.calls.lock().await.push(provider_id.to_owned());
            self.responses
                .get(provider_id)
                .cloned()
                .unwrap_or_else(|| Err(ProviderError::classified("unknown provider", None)))
        }
    }

    struct FailingVectors;

    #[async_trait]
    impl VectorSource for FailingVectors {
        async fn search(
            &self,
            _embedding: &[f32],
            _k: usize,
            _threshold: f32,
            _scope_filter: Option<&str>,
        ) -> Result<Vec<RankedEntry>, AppError> {
            Err(AppError::InternalError("vector store offline".into()))
        }
    }

    struct FailingRelevance;

    #[async_trait]
    impl RelevanceScorer for FailingRelevance {
        async fn score(&self, _query: &str, _document: &str) -> Result<f32, AppError> {
            Err(AppError::InternalError("scorer down".into()))
        }
    }

    fn corpus() -> Vec<Arc<Chunk>> {
        vec![
            Arc::new(
                Chunk::new(
                    "c1",
                    SCOPE,
                    "Tokio is an asynchronous runtime for the Rust programming language.",
                )
                .with_metadata("source", "tokio.md"),
            ),
            Arc::new(Chunk::new(
                "c2",
                SCOPE,
                "Serde is a framework for serializing and deserializing Rust data structures.",
            )),
            Arc::new(Chunk::new(
                "c3",
                SCOPE,
                "Sourdough bread needs flour, water, salt and a lively starter.",
            )),
            Arc::new(Chunk::new(
                "other",
                "session-2",
                "Tokio runtime internals for another session.",
            )),
        ]
    }

    async fn components(
        vectors: Option<Arc<dyn VectorSource>>,
        generator: Arc<ScriptedGenerator>,
        reranker: Reranker,
    ) -> RetrievalComponents {
        let embeddings = Arc::new(EmbeddingProvider::new_hashed(64).expect("hashed provider"));
        let chunks = corpus();

        let chunk_source = Arc::new(InMemoryChunkSource::new());
        chunk_source.extend(chunks.iter().map(Arc::clone)).await;

        let vectors = match vectors {
            Some(vectors) => vectors,
            None => {
                let source = Arc::new(InMemoryVectorSource::new());
                source.index(&embeddings, &chunks).await.expect("index vectors");
                source as Arc<dyn VectorSource>
            }
        };

        let executor = Arc::new(FallbackExecutor::new(
            Arc::new(ProviderHealthRegistry::default()),
            HashMap::from([(
                GENERATION_CATEGORY.to_string(),
                vec!["primary".to_string(), "backup".to_string()],
            )]),
        ));

        RetrievalComponents {
            lexical: Arc::new(LexicalIndex::new()),
            vectors,
            chunks: chunk_source,
            embeddings,
            generator,
            reranker: Arc::new(reranker),
            cache: Arc::new(SemanticCache::new(CacheSettings::default())),
            executor,
        }
    }

    async fn service_with(
        vectors: Option<Arc<dyn VectorSource>>,
        generator: Arc<ScriptedGenerator>,
        reranker: Reranker,
    ) -> RetrievalService {
        RetrievalService::new(
            components(vectors, generator, reranker).await,
            RetrievalConfig::default(),
        )
    }

    fn answer_json(answer: &str, reference: &str) -> Result<String, ProviderError> {
        Ok(format!(
            r#"{{"answer": "{answer}", "references": [{{"reference": "{reference}"}}]}}"#
        ))
    }

    #[tokio::test]
    async fn search_fuses_both_sources_within_scope() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let service = service_with(None, generator, Reranker::default()).await;

        let response = service
            .search("tokio asynchronous runtime", SCOPE, 2)
            .await
            .expect("search");

        assert_eq!(response.strategy, FusionStrategy::RrfFusion);
        assert!(response.lexical_count >= 1);
        assert_eq!(response.vector_count, 3);
        assert_eq!(response.fused_count, 3);
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].doc_id(), "c1");
        assert!(response
            .results
            .iter()
            .all(|result| result.chunk.scope_id == SCOPE));
    }

    #[tokio::test]
    async fn vector_failure_degrades_to_lexical_only() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let service = service_with(
            Some(Arc::new(FailingVectors)),
            generator,
            Reranker::default(),
        )
        .await;

        let response = service.search("serde", SCOPE, 5).await.expect("search");
        assert_eq!(response.strategy, FusionStrategy::LexicalOnly);
        assert_eq!(response.vector_count, 0);
        assert_eq!(response.results[0].doc_id(), "c2");
    }

    #[tokio::test]
    async fn zero_k_is_rejected() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let service = service_with(None, generator, Reranker::default()).await;
        assert!(matches!(
            service.search("tokio", SCOPE, 0).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn index_scope_reports_documents() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let service = service_with(None, generator, Reranker::default()).await;

        let report = service.index_scope(SCOPE, false).await.expect("index");
        assert_eq!(report.documents, 3);
        assert!(report.lexical_indexed);

        let empty = service.index_scope("missing", false).await.expect("index");
        assert_eq!(empty.documents, 0);
        assert!(!empty.lexical_indexed);
    }

    #[tokio::test]
    async fn search_picks_up_chunks_added_after_first_index() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let chunk_source = Arc::new(InMemoryChunkSource::new());
        chunk_source
            .insert(Arc::new(Chunk::new("n1", "growing", "tokio runtime basics")))
            .await;
        let service = RetrievalService::new(
            RetrievalComponents {
                chunks: Arc::clone(&chunk_source) as Arc<dyn ChunkSource>,
                ..components(Some(Arc::new(FailingVectors)), generator, Reranker::default())
                    .await
            },
            RetrievalConfig::default(),
        );

        let first = service.search("tokio", "growing", 5).await.expect("search");
        assert_eq!(first.lexical_count, 1);
        assert_eq!(service.components().lexical.document_count("growing"), 1);

        chunk_source
            .insert(Arc::new(Chunk::new(
                "n2",
                "growing",
                "serde zebra serialization",
            )))
            .await;

        let second = service.search("zebra", "growing", 5).await.expect("search");
        assert_eq!(second.lexical_count, 1);
        assert_eq!(second.results[0].doc_id(), "n2");
        assert_eq!(service.components().lexical.document_count("growing"), 2);
    }

    #[tokio::test]
    async fn tokenless_scope_is_remembered_between_searches() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let chunk_source = Arc::new(InMemoryChunkSource::new());
        chunk_source
            .insert(Arc::new(Chunk::new("q", "quiet", "?? !!")))
            .await;
        let service = RetrievalService::new(
            RetrievalComponents {
                chunks: Arc::clone(&chunk_source) as Arc<dyn ChunkSource>,
                ..components(Some(Arc::new(FailingVectors)), generator, Reranker::default())
                    .await
            },
            RetrievalConfig::default(),
        );

        for _ in 0..2 {
            let response = service.search("anything", "quiet", 5).await.expect("search");
            assert_eq!(response.lexical_count, 0);
            assert!(response.results.is_empty());
        }
        let lexical = &service.components().lexical;
        assert!(!lexical.has_index("quiet"));

        // The empty build is recorded against a chunk count of one, so a same-count
        // build is skipped instead of re-tokenised.
        let replacement = [Arc::new(Chunk::new("q", "quiet", "searchable words"))];
        assert!(!lexical.build("quiet", &replacement, false).await);
        assert!(lexical.build("quiet", &replacement, true).await);
    }

    #[tokio::test]
    async fn answer_falls_back_then_serves_repeat_from_cache() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            (
                "primary",
                Err(ProviderError::classified("429 Too Many Requests", Some(429))),
            ),
            ("backup", answer_json("Tokio is an async runtime.", "c1")),
        ]));
        let service = service_with(None, Arc::clone(&generator), Reranker::default()).await;

        let first = service
            .answer("what is tokio?", SCOPE, 3)
            .await
            .expect("answer");
        assert!(!first.cached);
        assert_eq!(first.answer.content, "Tokio is an async runtime.");
        assert_eq!(first.answer.references, vec!["c1".to_string()]);
        assert_eq!(first.provider_used.as_deref(), Some("backup"));
        assert!(first.used_fallback);
        assert_eq!(first.attempts, 2);
        assert_eq!(first.rerank_method, RerankMethod::None);
        assert!(!first.sources.is_empty());

        let health = service.get_health_status();
        let primary = health
            .iter()
            .find(|status| status.provider_id == "primary")
            .expect("primary tracked");
        assert!(!primary.healthy);
        assert_eq!(primary.last_failure_reason, Some(FailureReason::RateLimit));

        let second = service
            .answer("what is tokio?", SCOPE, 3)
            .await
            .expect("cached answer");
        assert!(second.cached);
        assert_eq!(second.answer, first.answer);
        assert!(second.cache_similarity >= 0.95);
        assert_eq!(generator.calls.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_generation_chain_reports_every_error() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            ("primary", Err(ProviderError::timeout("deadline exceeded"))),
            ("backup", Ok("not json".to_string())),
        ]));
        let service = service_with(None, generator, Reranker::default()).await;

        let err = service
            .answer("what is serde?", SCOPE, 3)
            .await
            .expect_err("chain exhausted");
        match err {
            AppError::FallbackExhausted { category, errors } => {
                assert_eq!(category, GENERATION_CATEGORY);
                let reasons: Vec<FailureReason> = errors.iter().map(|e| e.reason).collect();
                assert_eq!(
                    reasons,
                    vec![FailureReason::Timeout, FailureReason::InvalidResponse]
                );
            }
            other => panic!("expected FallbackExhausted, got {other:?}"),
        }
        assert!(service.components().cache.is_empty().await);
    }

    #[tokio::test]
    async fn failing_reranker_keeps_fused_order() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let reranker = Reranker::default().with_relevance(Arc::new(FailingRelevance));
        let service = service_with(None, generator, reranker).await;

        let search = service
            .search("rust runtime", SCOPE, 3)
            .await
            .expect("search");
        let fused_ids: Vec<String> = search
            .results
            .iter()
            .map(|result| result.doc_id().to_owned())
            .collect();

        let outcome = service.rerank("rust runtime", search.results, None).await;
        let reranked_ids: Vec<String> = outcome
            .results
            .iter()
            .map(|result| result.doc_id().to_owned())
            .collect();
        assert_eq!(outcome.method, RerankMethod::None);
        assert_eq!(reranked_ids, fused_ids);
    }

    #[tokio::test]
    async fn execute_with_fallback_uses_primary_first() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let service = service_with(None, generator, Reranker::default()).await;

        let result = service
            .execute_with_fallback(
                GENERATION_CATEGORY,
                |provider_id| async move { Ok::<_, AppError>(provider_id) },
                Some("backup"),
                0,
                Duration::from_secs(1),
            )
            .await
            .expect("executed");
        assert_eq!(result.result.as_deref(), Some("backup"));
        assert!(!result.used_fallback);
    }
}
