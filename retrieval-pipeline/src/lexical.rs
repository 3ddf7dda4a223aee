use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use common::types::{Chunk, RankedEntry};
use tracing::{debug, info};

/// Term frequency saturation.
const K1: f32 = 1.5;
/// Document length normalisation.
const B: f32 = 0.75;

/// Metadata fields appended to the chunk body before tokenising, so names and
/// filenames match even when the body never mentions them.
const SEARCHABLE_METADATA_FIELDS: [&str; 5] =
    ["candidate_name", "name", "filename", "source", "skills"];

/// Short tokens that survive the minimum-length filter.
const SHORT_TOKEN_ALLOWLIST: &[&str] = &[
    "ai", "ml", "ui", "ux", "qa", "hr", "it", "js", "ts", "go", "db", "os", "bi", "pm", "vp",
    "ci", "cd", "c", "r", "io", "ip", "id", "v8", "3d", "ar", "vr", "uk", "us", "eu",
];

/// Lowercases `text` and splits it into alphanumeric tokens, dropping tokens of two
/// characters or fewer unless they are known abbreviations.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() > 2 || SHORT_TOKEN_ALLOWLIST.contains(&token.as_str()))
        .collect()
}

fn searchable_text(chunk: &Chunk) -> String {
    let mut text = chunk.content.clone();
    for field in SEARCHABLE_METADATA_FIELDS {
        if let Some(value) = chunk.metadata_text(field) {
            text.push(' ');
            text.push_str(&value);
        }
    }
    text
}

#[derive(Debug)]
struct ScopeIndex {
    chunks: Vec<Arc<Chunk>>,
    term_frequencies: Vec<HashMap<String, u32>>,
    doc_lengths: Vec<f32>,
    doc_frequencies: HashMap<String, usize>,
    avg_doc_length: f32,
}

impl ScopeIndex {
    /// Returns `None` when no chunk produced a single token.
    fn build(chunks: &[Arc<Chunk>]) -> Option<Self> {
        let mut term_frequencies = Vec::with_capacity(chunks.len());
        let mut doc_lengths = Vec::with_capacity(chunks.len());
        let mut doc_frequencies: HashMap<String, usize> = HashMap::new();
        let mut total_tokens = 0usize;

        for chunk in chunks {
            let tokens = tokenize(&searchable_text(chunk));
            total_tokens += tokens.len();
            doc_lengths.push(tokens.len() as f32);

            let mut frequencies: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *frequencies.entry(token).or_default() += 1;
            }
            for term in frequencies.keys() {
                *doc_frequencies.entry(term.clone()).or_default() += 1;
            }
            term_frequencies.push(frequencies);
        }

        if total_tokens == 0 {
            return None;
        }

        Some(Self {
            chunks: chunks.to_vec(),
            term_frequencies,
            doc_lengths,
            doc_frequencies,
            avg_doc_length: total_tokens as f32 / chunks.len() as f32,
        })
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.chunks.len() as f32;
        let df = self.doc_frequencies.get(term).copied().unwrap_or(0) as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn score(&self, doc: usize, query_tokens: &[String]) -> f32 {
        let (Some(frequencies), Some(&length)) =
            (self.term_frequencies.get(doc), self.doc_lengths.get(doc))
        else {
            return 0.0;
        };

        let length_norm = K1 * (1.0 - B + B * length / self.avg_doc_length);
        query_tokens
            .iter()
            .filter_map(|term| {
                let tf = *frequencies.get(term)? as f32;
                Some(self.idf(term) * tf * (K1 + 1.0) / (tf + length_norm))
            })
            .sum()
    }
}

/// Result of the last build of a scope.
#[derive(Debug, Clone)]
enum ScopeEntry {
    Indexed(Arc<ScopeIndex>),
    /// No chunk yielded a token. Kept so an unchanged scope is not re-tokenised.
    Unsearchable { chunk_count: usize },
}

impl ScopeEntry {
    fn chunk_count(&self) -> usize {
        match self {
            Self::Indexed(index) => index.chunks.len(),
            Self::Unsearchable { chunk_count } => *chunk_count,
        }
    }

    fn is_indexed(&self) -> bool {
        matches!(self, Self::Indexed(_))
    }
}

/// Per-scope BM25 index over chunk text.
///
/// Each scope is built independently and never merged with another. Builds for the
/// same scope are serialized; searches read an immutable snapshot and take no lock
/// beyond cloning the scope's `Arc`.
#[derive(Default)]
pub struct LexicalIndex {
    scopes: RwLock<HashMap<String, ScopeEntry>>,
    build_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, scope_id: &str) -> Option<ScopeEntry> {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope_id)
            .cloned()
    }

    fn scope(&self, scope_id: &str) -> Option<Arc<ScopeIndex>> {
        match self.entry(scope_id)? {
            ScopeEntry::Indexed(index) => Some(index),
            ScopeEntry::Unsearchable { .. } => None,
        }
    }

    fn build_lock(&self, scope_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .build_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(scope_id.to_owned()).or_default())
    }

    /// Builds the index for `scope_id`.
    ///
    /// A scope that was already built from the same number of chunks is left alone
    /// unless `force` is set. Returns `false` when no chunk yields any token, in which
    /// case the scope has no index and searches against it return nothing. That outcome
    /// is remembered as well, so an unchanged tokenless scope is not rebuilt.
    pub async fn build(&self, scope_id: &str, chunks: &[Arc<Chunk>], force: bool) -> bool {
        let lock = self.build_lock(scope_id);
        let _guard = lock.lock().await;

        if !force {
            if let Some(existing) = self.entry(scope_id) {
                if existing.chunk_count() == chunks.len() {
                    debug!(scope_id, chunks = chunks.len(), "Lexical index up to date");
                    return existing.is_indexed();
                }
            }
        }

        let built = ScopeIndex::build(chunks);
        let mut scopes = self.scopes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = built {
            info!(
                scope_id,
                chunks = chunks.len(),
                terms = index.doc_frequencies.len(),
                "Built lexical index"
            );
            scopes.insert(scope_id.to_owned(), ScopeEntry::Indexed(Arc::new(index)));
            true
        } else {
            info!(
                scope_id,
                chunks = chunks.len(),
                "No searchable tokens in scope; lexical search disabled"
            );
            scopes.insert(
                scope_id.to_owned(),
                ScopeEntry::Unsearchable {
                    chunk_count: chunks.len(),
                },
            );
            false
        }
    }

    /// Returns up to `k` chunks scoring strictly above `min_score`, best first.
    pub fn search(&self, scope_id: &str, query: &str, k: usize, min_score: f32) -> Vec<RankedEntry> {
        let Some(index) = self.scope(scope_id) else {
            debug!(scope_id, "No lexical index for scope");
            return Vec::new();
        };

        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(Arc<Chunk>, f32)> = index
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(doc, chunk)| {
                let score = index.score(doc, &query_tokens);
                (score > min_score).then(|| (Arc::clone(chunk), score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(k);

        debug!(scope_id, hits = scored.len(), "Lexical search complete");
        RankedEntry::rank_in_order(scored)
    }

    pub fn has_index(&self, scope_id: &str) -> bool {
        self.scope(scope_id).is_some()
    }

    pub fn document_count(&self, scope_id: &str) -> usize {
        self.scope(scope_id).map_or(0, |index| index.chunks.len())
    }

    /// Drops the index for `scope_id`. Returns whether one existed.
    pub fn remove_scope(&self, scope_id: &str) -> bool {
        self.build_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope_id);
        self.scopes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope_id)
            .is_some_and(|entry| entry.is_indexed())
    }
}
