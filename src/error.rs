//! Error taxonomy for pipeline stages.
//!
//! Adapters around external collaborators (language models, embedders,
//! the repository host) return `anyhow::Result`; each stage folds those
//! failures into one of the variants below so callers can tell a
//! classification failure from a publish failure without string matching.

use std::path::PathBuf;

/// Fatal error for a single pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A required capability could not be constructed at startup.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// The analyzer returned an unusable verdict after its retry.
    #[error("classification error: {0}")]
    Classification(String),

    #[error("retrieval error: {0}")]
    Retrieval(#[source] IndexError),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("index write error: {0}")]
    IndexWrite(#[source] IndexError),

    #[error("ledger error at {path:?}: {source}")]
    Ledger {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),
}

impl PipelineError {
    /// Short machine-readable label used in progress events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Initialization(_) => "initialization",
            PipelineError::Classification(_) => "classification",
            PipelineError::Retrieval(_) => "retrieval",
            PipelineError::Generation(_) => "generation",
            PipelineError::IndexWrite(_) => "index_write",
            PipelineError::Ledger { .. } => "ledger",
            PipelineError::Publish(_) => "publish",
        }
    }
}

/// Knowledge index failures.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// No persisted index exists at the configured location. Distinct
    /// from an index that exists but holds zero entries.
    #[error("no index found at {0:?}")]
    NotFound(PathBuf),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("index storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("index was built with {expected} dims, embedder produces {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Remote publish failures.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("could not ensure branch '{branch}': {message}")]
    Branch { branch: String, message: String },

    /// A single file write failed; absorbed by `update_files`.
    #[error("could not update '{path}': {message}")]
    File { path: String, message: String },

    #[error("could not open pull request from '{branch}': {message}")]
    PullRequest { branch: String, message: String },

    #[error("repository host error: {0}")]
    Host(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        let err = PipelineError::Classification("missing field".into());
        assert_eq!(err.kind(), "classification");
        let err = PipelineError::from(PublishError::Host("down".into()));
        assert_eq!(err.kind(), "publish");
        assert!(err.to_string().contains("down"));
    }

    #[test]
    fn test_not_found_mentions_path() {
        let err = IndexError::NotFound(PathBuf::from("/tmp/idx.sqlite"));
        assert!(err.to_string().contains("idx.sqlite"));
    }
}
