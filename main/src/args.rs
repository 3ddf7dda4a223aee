use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Hybrid retrieval over a chunk corpus", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fuse lexical and vector rankings for a query
    Search(SearchArgs),
    /// Answer a question from the retrieved chunks
    Ask(AskArgs),
    /// Show configured fallback chains and provider health
    Health,
}

#[derive(Args, Debug, Clone)]
pub struct CorpusArgs {
    /// JSON file holding an array of chunks ({id, scope_id, content, metadata})
    #[arg(long)]
    pub chunks: PathBuf,

    /// Scope to search within
    #[arg(long)]
    pub scope: String,

    /// Query text
    #[arg(long)]
    pub query: String,

    /// Number of fused results to keep
    #[arg(short, long, default_value_t = 5)]
    pub k: usize,
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    #[command(flatten)]
    pub corpus: CorpusArgs,

    /// Rerank the fused results
    #[arg(long)]
    pub rerank: bool,

    /// Keep only this many results after reranking
    #[arg(long)]
    pub top_k: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct AskArgs {
    #[command(flatten)]
    pub corpus: CorpusArgs,

    /// Skip reranking before generation
    #[arg(long = "no-rerank", action = clap::ArgAction::SetFalse)]
    pub rerank: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_with_defaults() {
        let cli = Cli::try_parse_from([
            "retrieval", "search", "--chunks", "corpus.json", "--scope", "s1", "--query", "tokio",
        ])
        .expect("parse");
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.corpus.k, 5);
                assert_eq!(args.corpus.scope, "s1");
                assert!(!args.rerank);
                assert!(args.top_k.is_none());
            }
            other => panic!("expected search, got {other:?}"),
        }
    }

    #[test]
    fn ask_reranks_unless_disabled() {
        let base = [
            "retrieval", "ask", "--chunks", "c.json", "--scope", "s", "--query", "q",
        ];
        let cli = Cli::try_parse_from(base).expect("parse");
        assert!(matches!(cli.command, Command::Ask(ref args) if args.rerank));

        let cli = Cli::try_parse_from(base.into_iter().chain(["--no-rerank", "-k", "3"]))
            .expect("parse");
        match cli.command {
            Command::Ask(args) => {
                assert!(!args.rerank);
                assert_eq!(args.corpus.k, 3);
            }
            other => panic!("expected ask, got {other:?}"),
        }
    }

    #[test]
    fn health_takes_no_arguments() {
        let cli = Cli::try_parse_from(["retrieval", "health"]).expect("parse");
        assert!(matches!(cli.command, Command::Health));
    }
}
