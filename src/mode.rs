//! Create-versus-update decision.
//!
//! Pure function of a retrieval result and a threshold: no I/O, no clock,
//! no randomness.

use std::collections::BTreeSet;

use crate::models::{ConfidenceDecision, Mode, RetrievalResult};

/// Decide whether to revise the retrieved documents or author a new
/// section in the ledger at `fallback_path`.
///
/// `confidence` is the best hit's score (0.0 when there are no hits).
/// UPDATE requires a non-empty result whose confidence reaches
/// `threshold`; its targets are the distinct source paths of every hit.
pub fn select(result: &RetrievalResult, threshold: f64, fallback_path: &str) -> ConfidenceDecision {
    let confidence = result.max_score().unwrap_or(0.0);

    if result.is_empty() || confidence < threshold {
        return ConfidenceDecision {
            mode: Mode::Create,
            confidence,
            target_sources: BTreeSet::from([fallback_path.to_string()]),
        };
    }

    ConfidenceDecision {
        mode: Mode::Update,
        confidence,
        target_sources: result
            .hits
            .iter()
            .map(|h| h.chunk.source_path.clone())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentChunk, ScoredChunk};

    const LEDGER: &str = "docs/DOC_LEDGER.md";

    fn result(hits: &[(&str, f64)]) -> RetrievalResult {
        RetrievalResult::new(
            hits.iter()
                .enumerate()
                .map(|(i, (path, score))| ScoredChunk {
                    chunk: DocumentChunk {
                        content: format!("chunk {}", i),
                        source_path: path.to_string(),
                        chunk_index: i as i64,
                    },
                    score: *score,
                })
                .collect(),
        )
    }

    #[test]
    fn test_empty_result_creates_in_ledger() {
        let decision = select(&RetrievalResult::default(), 0.0, LEDGER);
        assert_eq!(decision.mode, Mode::Create);
        assert_eq!(decision.confidence, 0.0);
        assert_eq!(decision.target_sources, BTreeSet::from([LEDGER.to_string()]));
    }

    #[test]
    fn test_high_score_updates_hit_sources() {
        let decision = select(&result(&[("docs/api.md", 0.8)]), 0.5, LEDGER);
        assert_eq!(decision.mode, Mode::Update);
        assert!((decision.confidence - 0.8).abs() < 1e-9);
        assert_eq!(
            decision.target_sources,
            BTreeSet::from(["docs/api.md".to_string()])
        );
    }

    #[test]
    fn test_below_threshold_creates() {
        let decision = select(&result(&[("docs/api.md", 0.3)]), 0.5, LEDGER);
        assert_eq!(decision.mode, Mode::Create);
        assert!((decision.confidence - 0.3).abs() < 1e-9);
        assert!(decision.target_sources.contains(LEDGER));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let decision = select(&result(&[("docs/api.md", 0.5)]), 0.5, LEDGER);
        assert_eq!(decision.mode, Mode::Update);
    }

    #[test]
    fn test_update_targets_are_unique_paths() {
        let r = result(&[("docs/a.md", 0.9), ("docs/a.md", 0.7), ("docs/b.md", 0.2)]);
        let decision = select(&r, 0.5, LEDGER);
        assert_eq!(
            decision.target_sources,
            BTreeSet::from(["docs/a.md".to_string(), "docs/b.md".to_string()])
        );
    }

    #[test]
    fn test_mode_matches_invariant_across_grid() {
        let scores = [-0.2, 0.0, 0.1, 0.49, 0.5, 0.51, 0.99, 1.0];
        let thresholds = [0.0, 0.25, 0.5, 0.75, 1.0];
        for &t in &thresholds {
            assert_eq!(select(&RetrievalResult::default(), t, LEDGER).mode, Mode::Create);
            for &s in &scores {
                let r = result(&[("docs/x.md", s), ("docs/y.md", s - 0.1)]);
                let first = select(&r, t, LEDGER);
                let second = select(&r, t, LEDGER);
                assert_eq!(first, second, "select must be deterministic");
                let expected = if s < t { Mode::Create } else { Mode::Update };
                assert_eq!(first.mode, expected, "score {} threshold {}", s, t);
            }
        }
    }
}
