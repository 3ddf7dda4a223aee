mod args;
mod corpus;

use std::{collections::BTreeMap, sync::Arc};

use args::{AskArgs, Cli, Command, CorpusArgs, SearchArgs};
use clap::Parser;
use common::utils::config::{get_config, AppConfig};
use retrieval_pipeline::{
    InMemoryChunkSource, InMemoryVectorSource, RetrievalComponents, RetrievalConfig,
    RetrievalService, VectorSource,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type OpenAiClient = async_openai::Client<async_openai::config::OpenAIConfig>;

#[derive(Serialize)]
struct SearchOutput {
    search: retrieval_pipeline::SearchResponse,
    rerank: Option<retrieval_pipeline::RerankOutcome>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .ok();

    let cli = Cli::parse();

    // Get config
    let config = get_config()?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    match cli.command {
        Command::Search(args) => run_search(&config, openai_client, args).await?,
        Command::Ask(args) => run_ask(&config, openai_client, args).await?,
        Command::Health => run_health(&config, openai_client).await?,
    }

    Ok(())
}

async fn build_service(
    config: &AppConfig,
    openai_client: Arc<OpenAiClient>,
    corpus_args: &CorpusArgs,
    retrieval: RetrievalConfig,
) -> Result<RetrievalService, Box<dyn std::error::Error>> {
    let chunks = corpus::load_chunks(&corpus_args.chunks).await?;

    let chunk_source = Arc::new(InMemoryChunkSource::new());
    chunk_source.extend(chunks.iter().map(Arc::clone)).await;
    let vectors = Arc::new(InMemoryVectorSource::new());

    let components = RetrievalComponents::from_config(
        config,
        Some(openai_client),
        Arc::clone(&vectors) as Arc<dyn VectorSource>,
        chunk_source,
    )
    .await?;

    let indexed = vectors.index(&components.embeddings, &chunks).await?;
    info!(indexed, "Chunk embeddings ready");

    let service = RetrievalService::new(components, retrieval);
    let report = service.index_scope(&corpus_args.scope, false).await?;
    info!(
        scope_id = %report.scope_id,
        documents = report.documents,
        lexical_indexed = report.lexical_indexed,
        "Scope indexed"
    );

    Ok(service)
}

async fn run_search(
    config: &AppConfig,
    openai_client: Arc<OpenAiClient>,
    args: SearchArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let retrieval = RetrievalConfig::from_app_config(config)
        .with_rerank(args.rerank)
        .with_rerank_top_k(args.top_k);
    let service = build_service(config, openai_client, &args.corpus, retrieval).await?;

    let search = service
        .search(&args.corpus.query, &args.corpus.scope, args.corpus.k)
        .await?;
    let rerank = if args.rerank {
        Some(
            service
                .rerank(&args.corpus.query, search.results.clone(), args.top_k)
                .await,
        )
    } else {
        None
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&SearchOutput { search, rerank })?
    );
    Ok(())
}

async fn run_ask(
    config: &AppConfig,
    openai_client: Arc<OpenAiClient>,
    args: AskArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let retrieval = RetrievalConfig::from_app_config(config).with_rerank(args.rerank);
    let service = build_service(config, openai_client, &args.corpus, retrieval).await?;

    let answer = service
        .answer(&args.corpus.query, &args.corpus.scope, args.corpus.k)
        .await?;
    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(())
}

async fn run_health(
    config: &AppConfig,
    openai_client: Arc<OpenAiClient>,
) -> Result<(), Box<dyn std::error::Error>> {
    let components = RetrievalComponents::from_config(
        config,
        Some(openai_client),
        Arc::new(InMemoryVectorSource::new()),
        Arc::new(InMemoryChunkSource::new()),
    )
    .await?;
    let service = RetrievalService::new(components, RetrievalConfig::from_app_config(config));

    let chains: BTreeMap<_, _> = config.fallback.chains.iter().collect();
    let providers: BTreeMap<_, _> = config
        .fallback
        .providers
        .iter()
        .map(|(id, endpoint)| {
            (
                id,
                json!({ "base_url": endpoint.base_url, "model": endpoint.model }),
            )
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "chains": chains,
            "providers": providers,
            "health": service.get_health_status(),
            "reranking_enabled": config.reranking.enabled,
            "llm_fallback_enabled": config.reranking.llm_fallback_enabled,
            "cache_enabled": config.cache.enabled,
        }))?
    );
    Ok(())
}
