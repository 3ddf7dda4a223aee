pub mod answer_retrieval;
pub mod cache;
pub mod lexical;
pub mod pipeline;
pub mod providers;
pub mod reranking;
pub mod resilience;
pub mod scoring;
pub mod sources;

pub use cache::{CacheEntry, CacheLookup, CacheStats, SemanticCache};
pub use lexical::LexicalIndex;
pub use pipeline::{
    AnswerResponse, IndexReport, RetrievalComponents, RetrievalConfig, RetrievalService,
    SearchResponse,
};
pub use reranking::{RerankMethod, RerankOutcome, Reranker};
pub use resilience::{FallbackExecutor, FallbackResult, ProviderHealthRegistry, ProviderStatus};
pub use scoring::{FusionEngine, FusionOutcome};
pub use sources::{ChunkSource, InMemoryChunkSource, InMemoryVectorSource, VectorSource};
