#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use docsync::embedding::{Embedder, HashEmbedder, DEFAULT_HASH_DIMS};
use docsync::index::{IndexOptions, KnowledgeIndex};
use docsync::ledger::KnowledgeLedger;
use docsync::llm::LanguageModel;
use docsync::models::{Document, PipelineRun};
use docsync::pipeline::{RunSettings, Services};

pub const LEDGER_SOURCE: &str = "docs/DOC_LEDGER.md";
pub const DOC_TEXT: &str = "## Profile endpoint\n\nGET /profile returns the signed-in user's profile.";
pub const CHANGELOG: &str = "A push by octocat to the file `src/api.rs` has added a profile endpoint.";

/// Answers by task: a verdict for the classifier, a fixed document for
/// the writer prompts, and a fixed changelog sentence.
pub struct ScriptedModel {
    functional: bool,
    summary: String,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn functional(summary: &str) -> Arc<Self> {
        Arc::new(Self {
            functional: true,
            summary: summary.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn trivial(summary: &str) -> Arc<Self> {
        Arc::new(Self {
            functional: false,
            summary: summary.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, system: &str, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if system.contains("code reviewer") {
            return Ok(serde_json::json!({
                "is_functional_change": self.functional,
                "analysis_summary": self.summary,
            })
            .to_string());
        }
        if system.contains("changelog") {
            return Ok(CHANGELOG.to_string());
        }
        Ok(DOC_TEXT.to_string())
    }
}

pub fn embedder() -> Arc<dyn Embedder> {
    Arc::new(HashEmbedder::new(DEFAULT_HASH_DIMS))
}

pub fn settings() -> RunSettings {
    RunSettings {
        top_k: 3,
        confidence_threshold: 0.5,
        create_on_low_confidence: true,
        ledger_source: LEDGER_SOURCE.to_string(),
    }
}

/// Services over a fresh index built from `docs` inside `dir`.
pub async fn services(
    dir: &Path,
    docs: &[Document],
    llm: Arc<dyn LanguageModel>,
    settings: RunSettings,
) -> Services {
    let index = KnowledgeIndex::build(
        &dir.join("index.sqlite"),
        embedder(),
        IndexOptions::default(),
        docs,
    )
    .await
    .unwrap();
    let ledger = KnowledgeLedger::new(dir.join("DOC_LEDGER.md"));
    Services::new(llm, index, ledger, settings)
}

pub fn run(diff: &str) -> PipelineRun {
    PipelineRun {
        diff: diff.to_string(),
        title: "Add profile endpoint".to_string(),
        repo_id: "acme/widgets".to_string(),
        change_id: "42".to_string(),
        author: "octocat".to_string(),
    }
}

pub const FUNCTIONAL_DIFF: &str = "diff --git a/src/api.rs b/src/api.rs\n\
--- a/src/api.rs\n\
+++ b/src/api.rs\n\
@@ -1,3 +1,6 @@\n\
+pub async fn profile() -> Json<Profile> {\n\
+    Json(current_user().profile())\n\
+}\n";
