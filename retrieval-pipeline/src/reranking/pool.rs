use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use async_trait::async_trait;
use common::{error::AppError, utils::config::AppConfig};
use fastembed::{RerankInitOptions, TextRerank};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::{PairScore, PairwiseScorer};

/// FastEmbed cross-encoders shared behind a semaphore.
pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
    next_engine: AtomicUsize,
}

impl RerankerPool {
    /// Build the pool at startup.
    /// `pool_size` controls max parallel reranks.
    pub fn new(pool_size: usize) -> Result<Arc<Self>, AppError> {
        Self::new_with_options(pool_size, RerankInitOptions::default())
    }

    fn new_with_options(
        pool_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranking pool_size must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating reranking engine: {x}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            next_engine: AtomicUsize::new(0),
        }))
    }

    /// Initialize a pool using application configuration.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranking.enabled {
            return Ok(None);
        }

        let pool_size = config.reranking.pool_size.unwrap_or_else(default_pool_size);

        let init_options = build_rerank_init_options(config)?;
        Self::new_with_options(pool_size, init_options).map(Some)
    }

    /// Check out capacity + pick an engine.
    pub async fn checkout(self: &Arc<Self>) -> Result<RerankerLease, AppError> {
        // Acquire a permit. This enforces backpressure.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("reranker pool closed".to_string()))?;

        let idx = self.next_engine.fetch_add(1, Ordering::Relaxed) % self.engines.len();
        let engine = self
            .engines
            .get(idx)
            .cloned()
            .ok_or_else(|| AppError::InternalError("reranker pool is empty".to_string()))?;

        Ok(RerankerLease {
            _permit: permit,
            engine,
        })
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

fn build_rerank_init_options(config: &AppConfig) -> Result<RerankInitOptions, AppError> {
    let mut options = RerankInitOptions::default();

    let cache_dir = config
        .fastembed_cache_dir
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| env::var("RERANKING_CACHE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| {
            Path::new(&config.data_dir)
                .join("fastembed")
                .join("reranker")
        });
    fs::create_dir_all(&cache_dir)?;
    options.cache_dir = cache_dir;
    options.show_download_progress = config.fastembed_show_download_progress.unwrap_or(true);

    if let Some(max_length) = config.fastembed_max_length {
        options.max_length = max_length;
    }

    Ok(options)
}

/// Locks `engine` and runs `task` on the blocking thread pool.
async fn with_engine_blocking<E, T, F>(engine: &Arc<Mutex<E>>, task: F) -> Result<T, AppError>
where
    E: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut E) -> T + Send + 'static,
{
    let mut guard = Arc::clone(engine).lock_owned().await;
    Ok(tokio::task::spawn_blocking(move || task(&mut *guard)).await?)
}

/// Active lease on a single TextRerank instance.
pub struct RerankerLease {
    // When this drops the semaphore permit is released.
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

impl RerankerLease {
    pub async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<PairScore>, AppError> {
        let query = query.to_owned();
        let results = with_engine_blocking(&self.engine, move |engine| {
            engine.rerank(query, documents, false, None)
        })
        .await?
        .map_err(|e| AppError::InternalError(e.to_string()))?;

        Ok(results
            .into_iter()
            .map(|result| PairScore {
                index: result.index,
                score: result.score,
            })
            .collect())
    }
}

#[async_trait]
impl PairwiseScorer for Arc<RerankerPool> {
    async fn score_pairs(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<PairScore>, AppError> {
        self.checkout().await?.rerank(query, documents).await
    }
}
