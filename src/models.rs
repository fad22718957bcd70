//! Core data models used throughout docsync.
//!
//! These types are the only things pipeline stages hand to each other:
//! documents and chunks flowing into the index, scored retrieval hits
//! flowing out, and the verdicts and decisions that steer a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A knowledge-base document as loaded from disk or produced by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Canonical repository-relative path (e.g. `docs/api.md`).
    pub source_path: String,
    pub content: String,
}

impl Document {
    pub fn new(source_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            content: content.into(),
        }
    }
}

/// A bounded window of a document's text; the unit of semantic indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentChunk {
    pub content: String,
    pub source_path: String,
    pub chunk_index: i64,
}

/// One retrieval hit.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f64,
}

/// Hits ordered by descending score.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn new(mut hits: Vec<ScoredChunk>) -> Self {
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self { hits }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Highest score, or `None` for an empty result.
    pub fn max_score(&self) -> Option<f64> {
        self.hits.iter().map(|h| h.score).reduce(f64::max)
    }

    /// Render hits as prompt context, one labelled snippet per chunk.
    pub fn to_context(&self) -> String {
        if self.hits.is_empty() {
            return "No old documentation snippets were found.".to_string();
        }
        self.hits
            .iter()
            .enumerate()
            .map(|(i, h)| {
                format!(
                    "--- Snippet {} (Source: {}) ---\n{}",
                    i + 1,
                    h.chunk.source_path,
                    h.chunk.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Structured verdict on a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationVerdict {
    pub is_functional_change: bool,
    pub analysis_summary: String,
}

/// The unit of work for one change event.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub diff: String,
    pub title: String,
    /// `owner/name` of the repository the change landed in.
    pub repo_id: String,
    /// Stable identifier of the triggering change (PR number or short sha).
    pub change_id: String,
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Create,
    Update,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Create => write!(f, "CREATE"),
            Mode::Update => write!(f, "UPDATE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceDecision {
    pub mode: Mode,
    pub confidence: f64,
    pub target_sources: BTreeSet<String>,
}

/// Generated documentation awaiting publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedDoc {
    pub text: String,
    pub target_sources: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, score: f64) -> ScoredChunk {
        ScoredChunk {
            chunk: DocumentChunk {
                content: format!("content of {}", path),
                source_path: path.to_string(),
                chunk_index: 0,
            },
            score,
        }
    }

    #[test]
    fn test_retrieval_result_sorted_desc() {
        let result = RetrievalResult::new(vec![hit("a.md", 0.1), hit("b.md", 0.9), hit("c.md", 0.4)]);
        let scores: Vec<f64> = result.hits.iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![0.9, 0.4, 0.1]);
        assert_eq!(result.max_score(), Some(0.9));
    }

    #[test]
    fn test_empty_result_has_no_max() {
        let result = RetrievalResult::default();
        assert!(result.is_empty());
        assert_eq!(result.max_score(), None);
        assert!(result.to_context().contains("No old documentation"));
    }

    #[test]
    fn test_context_labels_sources() {
        let result = RetrievalResult::new(vec![hit("docs/api.md", 0.7)]);
        let ctx = result.to_context();
        assert!(ctx.starts_with("--- Snippet 1 (Source: docs/api.md) ---"));
        assert!(ctx.contains("content of docs/api.md"));
    }
}
