use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use common::{
    types::{FusedResult, FusionStrategy, RankedEntry},
    utils::config::RetrievalTuning,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Weights used for linear score fusion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FusionWeights {
    pub vector: f32,
    pub lexical: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            lexical: 0.3,
        }
    }
}

/// Parameters for [`FusionEngine`].
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// Reciprocal rank fusion constant.
    pub rrf_k: f32,
    pub weights: FusionWeights,
    /// Used instead of `rrf_fusion` when both rankings are present.
    pub preferred: Option<FusionStrategy>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            weights: FusionWeights::default(),
            preferred: None,
        }
    }
}

impl From<&RetrievalTuning> for FusionConfig {
    fn from(tuning: &RetrievalTuning) -> Self {
        Self {
            rrf_k: tuning.rrf_k,
            weights: FusionWeights {
                vector: tuning.vector_weight,
                lexical: tuning.lexical_weight,
            },
            preferred: tuning.fusion_strategy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusionOutcome {
    pub results: Vec<FusedResult>,
    pub strategy: FusionStrategy,
}

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

fn sanitize_weight(weight: f32) -> f32 {
    if weight.is_finite() {
        weight.max(0.0)
    } else {
        0.0
    }
}

/// Stable descending sort. Equal scores keep their incoming order.
pub fn sort_by_final_desc(results: &mut [FusedResult]) {
    results.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(Ordering::Equal)
    });
}

/// Merges a lexical and a vector ranking into one ordered list.
#[derive(Debug, Clone, Default)]
pub struct FusionEngine {
    config: FusionConfig,
}

impl FusionEngine {
    pub const fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Picks a strategy from which rankings are non-empty.
    ///
    /// A requested strategy only applies when both rankings are present; with a single
    /// source the result is always that source's pass-through.
    pub fn select_strategy(
        &self,
        lexical: &[RankedEntry],
        vector: &[RankedEntry],
        requested: Option<FusionStrategy>,
    ) -> FusionStrategy {
        match (lexical.is_empty(), vector.is_empty()) {
            (false, true) => FusionStrategy::LexicalOnly,
            (true, false | true) => FusionStrategy::VectorOnly,
            (false, false) => requested
                .or(self.config.preferred)
                .unwrap_or(FusionStrategy::RrfFusion),
        }
    }

    pub fn fuse(
        &self,
        lexical: &[RankedEntry],
        vector: &[RankedEntry],
        requested: Option<FusionStrategy>,
    ) -> FusionOutcome {
        let strategy = self.select_strategy(lexical, vector, requested);
        let results = match strategy {
            FusionStrategy::LexicalOnly => pass_through(lexical, Source::Lexical),
            FusionStrategy::VectorOnly => pass_through(vector, Source::Vector),
            FusionStrategy::RrfFusion => reciprocal_rank_fusion(lexical, vector, self.config.rrf_k),
            FusionStrategy::WeightedFusion => weighted_fusion(lexical, vector, self.config.weights),
        };

        debug!(
            strategy = %strategy,
            lexical = lexical.len(),
            vector = vector.len(),
            fused = results.len(),
            "Fused rankings"
        );

        FusionOutcome { results, strategy }
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Lexical,
    Vector,
}

/// Accumulates results keyed by document id, remembering first-seen order.
#[derive(Default)]
struct Merged {
    positions: HashMap<String, usize>,
    results: Vec<FusedResult>,
}

impl Merged {
    /// Records `entry` for `source`. Returns `None` when the document was already
    /// seen in this source's ranking.
    fn record(&mut self, entry: &RankedEntry, source: Source) -> Option<&mut FusedResult> {
        let position = *self
            .positions
            .entry(entry.doc_id().to_owned())
            .or_insert_with(|| {
                self.results.push(FusedResult::new(Arc::clone(&entry.chunk)));
                self.results.len() - 1
            });
        let result = self.results.get_mut(position)?;

        match source {
            Source::Lexical if result.lexical_rank.is_none() => {
                result.lexical_rank = Some(entry.rank);
                result.lexical_score = Some(entry.score);
                Some(result)
            }
            Source::Vector if result.vector_rank.is_none() => {
                result.vector_rank = Some(entry.rank);
                result.vector_score = Some(entry.score);
                Some(result)
            }
            _ => None,
        }
    }

    fn into_sorted(mut self) -> Vec<FusedResult> {
        sort_by_final_desc(&mut self.results);
        self.results
    }
}

fn pass_through(ranking: &[RankedEntry], source: Source) -> Vec<FusedResult> {
    let mut merged = Merged::default();
    for entry in ranking {
        if let Some(result) = merged.record(entry, source) {
            result.final_score = entry.score;
        }
    }
    merged.results
}

/// `score(d) = Σ 1 / (k + rank)` over the rankings containing `d`, ranks 1-based.
pub fn reciprocal_rank_fusion(
    lexical: &[RankedEntry],
    vector: &[RankedEntry],
    k: f32,
) -> Vec<FusedResult> {
    let k = if k.is_finite() && k > 0.0 { k } else { 60.0 };
    let mut merged = Merged::default();

    for (ranking, source) in [(lexical, Source::Lexical), (vector, Source::Vector)] {
        for entry in ranking {
            if let Some(result) = merged.record(entry, source) {
                result.final_score += 1.0 / (k + entry.rank as f32);
            }
        }
    }

    merged.into_sorted()
}

/// Divides each score by its source's maximum and blends the two sources linearly.
/// A source whose maximum is not positive contributes zero for every document.
pub fn weighted_fusion(
    lexical: &[RankedEntry],
    vector: &[RankedEntry],
    weights: FusionWeights,
) -> Vec<FusedResult> {
    let mut merged = Merged::default();

    for (ranking, source, weight) in [
        (lexical, Source::Lexical, sanitize_weight(weights.lexical)),
        (vector, Source::Vector, sanitize_weight(weights.vector)),
    ] {
        let max = max_score(ranking);
        for entry in ranking {
            let normalized = if max > 0.0 {
                clamp_unit(entry.score / max)
            } else {
                0.0
            };
            if let Some(result) = merged.record(entry, source) {
                result.final_score += weight * normalized;
            }
        }
    }

    merged.into_sorted()
}

fn max_score(ranking: &[RankedEntry]) -> f32 {
    ranking
        .iter()
        .map(|entry| entry.score)
        .filter(|score| score.is_finite())
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::Chunk;

    fn ranking(entries: &[(&str, f32)]) -> Vec<RankedEntry> {
        RankedEntry::rank_in_order(
            entries
                .iter()
                .map(|(id, score)| (Arc::new(Chunk::new(*id, "s", format!("doc {id}"))), *score))
                .collect(),
        )
    }

    fn ids(results: &[FusedResult]) -> Vec<&str> {
        results.iter().map(FusedResult::doc_id).collect()
    }

    #[test]
    fn rrf_breaks_ties_by_first_seen_order() {
        let lexical = ranking(&[("A", 9.0), ("B", 5.0), ("C", 1.0)]);
        let vector = ranking(&[("B", 0.9), ("A", 0.8), ("D", 0.7)]);

        let outcome = FusionEngine::default().fuse(&lexical, &vector, None);
        assert_eq!(outcome.strategy, FusionStrategy::RrfFusion);
        assert_eq!(ids(&outcome.results), vec!["A", "B", "C", "D"]);

        let a = outcome.results[0].final_score;
        let b = outcome.results[1].final_score;
        assert!((a - 0.032_522).abs() < 1e-5);
        assert!((a - b).abs() < f32::EPSILON);
        assert!((outcome.results[2].final_score - 1.0 / 63.0).abs() < 1e-6);
        assert!((outcome.results[3].final_score - 1.0 / 63.0).abs() < 1e-6);

        let a = &outcome.results[0];
        assert_eq!(a.lexical_rank, Some(1));
        assert_eq!(a.vector_rank, Some(2));
        assert_eq!(outcome.results[3].lexical_rank, None);
    }

    #[test]
    fn single_source_passes_through_unchanged() {
        let lexical = ranking(&[("x", 3.0), ("y", 2.0), ("z", 2.0)]);
        let engine = FusionEngine::default();

        let outcome = engine.fuse(&lexical, &[], None);
        assert_eq!(outcome.strategy, FusionStrategy::LexicalOnly);
        assert_eq!(ids(&outcome.results), vec!["x", "y", "z"]);
        let scores: Vec<f32> = outcome.results.iter().map(|r| r.final_score).collect();
        assert_eq!(scores, vec![3.0, 2.0, 2.0]);

        let vector = ranking(&[("q", 0.4), ("p", 0.9)]);
        let outcome = engine.fuse(&[], &vector, Some(FusionStrategy::WeightedFusion));
        assert_eq!(outcome.strategy, FusionStrategy::VectorOnly);
        assert_eq!(ids(&outcome.results), vec!["q", "p"]);
        assert_eq!(outcome.results[1].vector_score, Some(0.9));
    }

    #[test]
    fn empty_inputs_fuse_to_nothing() {
        let outcome = FusionEngine::default().fuse(&[], &[], None);
        assert!(outcome.results.is_empty());
    }

    #[test]
    fn weighted_fusion_normalizes_by_source_max() {
        let lexical = ranking(&[("A", 10.0), ("B", 5.0)]);
        let vector = ranking(&[("B", 0.8), ("C", 0.4)]);

        let results = weighted_fusion(&lexical, &vector, FusionWeights::default());
        assert_eq!(ids(&results), vec!["B", "C", "A"]);
        // B: 0.7 * 1.0 + 0.3 * 0.5
        assert!((results[0].final_score - 0.85).abs() < 1e-6);
        assert!((results[1].final_score - 0.35).abs() < 1e-6);
        assert!((results[2].final_score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn weighted_fusion_zero_scores_contribute_nothing() {
        let lexical = ranking(&[("A", 0.0), ("B", 0.0)]);
        let vector = ranking(&[("B", 0.5), ("A", 0.25)]);

        let results = weighted_fusion(&lexical, &vector, FusionWeights::default());
        for result in &results {
            assert!(result.final_score.is_finite());
        }
        assert_eq!(ids(&results), vec!["B", "A"]);
        assert!((results[0].final_score - 0.7).abs() < 1e-6);
        assert!((results[1].final_score - 0.35).abs() < 1e-6);
    }

    #[test]
    fn configured_strategy_applies_when_both_sources_present() {
        let config = FusionConfig {
            preferred: Some(FusionStrategy::WeightedFusion),
            ..FusionConfig::default()
        };
        let engine = FusionEngine::new(config);
        let lexical = ranking(&[("A", 1.0)]);
        let vector = ranking(&[("B", 1.0)]);

        assert_eq!(
            engine.fuse(&lexical, &vector, None).strategy,
            FusionStrategy::WeightedFusion
        );
        assert_eq!(
            engine
                .fuse(&lexical, &vector, Some(FusionStrategy::RrfFusion))
                .strategy,
            FusionStrategy::RrfFusion
        );
    }

    #[test]
    fn duplicate_entries_within_a_ranking_count_once() {
        let mut lexical = ranking(&[("A", 2.0), ("B", 1.0)]);
        lexical.push(RankedEntry::new(lexical[0].chunk.clone(), 2.0, 3));

        let results = reciprocal_rank_fusion(&lexical, &[], 60.0);
        assert_eq!(results.len(), 2);
        assert!((results[0].final_score - 1.0 / 61.0).abs() < 1e-6);
    }
}
