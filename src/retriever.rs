//! Relevance retrieval against the knowledge index.

use tracing::{debug, instrument};

use crate::error::PipelineError;
use crate::index::KnowledgeIndex;
use crate::models::RetrievalResult;

/// Queries the shared index handle on every call, so documents added by
/// earlier runs are visible immediately.
#[derive(Clone)]
pub struct RelevanceRetriever {
    index: KnowledgeIndex,
}

impl RelevanceRetriever {
    pub fn new(index: KnowledgeIndex) -> Self {
        Self { index }
    }

    #[instrument(skip_all, fields(k))]
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalResult, PipelineError> {
        let result = self
            .index
            .query(query, k)
            .await
            .map_err(PipelineError::Retrieval)?;
        for hit in &result.hits {
            debug!(
                source = %hit.chunk.source_path,
                chunk = hit.chunk.chunk_index,
                score = hit.score,
                "retrieved"
            );
        }
        Ok(result)
    }
}
