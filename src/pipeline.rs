//! End-to-end run for one change event.
//!
//! ```text
//! classify ─▶ gate ─▶ retrieve ─▶ select ─▶ generate      (draft)
//!    ─▶ ledger append ─▶ index add ─▶ publish ─▶ changelog (commit)
//! ```
//!
//! Stages run strictly in order and hand each other only the types in
//! [`crate::models`]. A run never panics the process: every outcome,
//! including failures, is returned as a [`RunOutcome`].
//!
//! All capabilities live in [`Services`], built once at startup. A tenant
//! with its own model settings gets a derived `Services` for its runs via
//! [`Services::with_language_model`]; nothing global changes. Registered
//! tenants also get their own index and ledger through
//! [`Services::for_tenant`], so retrieval for one repository never returns
//! another repository's paths.
//!
//! Every generated text is appended to the ledger and indexed under the
//! ledger's repository path. The publish step always writes the ledger
//! alongside the decision's targets, so indexed ledger content is present
//! in the published repository.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::classifier::ChangeClassifier;
use crate::config::{Config, LlmConfig};
use crate::docs_loader::load_documents;
use crate::embedding::create_embedder;
use crate::error::{IndexError, PipelineError};
use crate::generator::ContentGenerator;
use crate::index::{IndexOptions, IndexStats, KnowledgeIndex};
use crate::ledger::KnowledgeLedger;
use crate::llm::{create_language_model, LanguageModel};
use crate::mode::select;
use crate::models::{
    ClassificationVerdict, ConfidenceDecision, Document, GeneratedDoc, Mode, PipelineRun,
    RetrievalResult,
};
use crate::progress::ProgressSender;
use crate::publish::{PublishContent, PublishOutcome, PublishPipeline, PublishRequest, PullRequest};
use crate::retriever::RelevanceRetriever;

/// Run-level knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub top_k: usize,
    pub confidence_threshold: f64,
    pub create_on_low_confidence: bool,
    /// Repository path of the ledger; the CREATE target.
    pub ledger_source: String,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            confidence_threshold: config.retrieval.confidence_threshold,
            create_on_low_confidence: config.retrieval.create_on_low_confidence,
            ledger_source: config.knowledge.ledger_source.clone(),
        }
    }
}

/// Capabilities shared by every run.
#[derive(Clone)]
pub struct Services {
    pub classifier: ChangeClassifier,
    pub generator: ContentGenerator,
    pub retriever: RelevanceRetriever,
    pub index: KnowledgeIndex,
    pub ledger: KnowledgeLedger,
    pub publisher: Option<PublishPipeline>,
    pub settings: RunSettings,
}

impl Services {
    /// Assemble services from already-constructed capabilities.
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        index: KnowledgeIndex,
        ledger: KnowledgeLedger,
        settings: RunSettings,
    ) -> Self {
        Self {
            classifier: ChangeClassifier::new(llm.clone()),
            generator: ContentGenerator::new(llm),
            retriever: RelevanceRetriever::new(index.clone()),
            index,
            ledger,
            publisher: None,
            settings,
        }
    }

    /// Build every capability from configuration. Opens the knowledge
    /// index, building it from the docs root the first time.
    pub async fn initialize(config: &Config) -> Result<Self, PipelineError> {
        let init = |what: &str, e: &dyn std::fmt::Display| {
            PipelineError::Initialization(format!("{}: {}", what, e))
        };

        let embedder = create_embedder(&config.embedding).map_err(|e| init("embedding provider", &e))?;
        let llm = create_language_model(&config.llm).map_err(|e| init("language model", &e))?;
        let options = IndexOptions::from_config(config);
        let path = &config.knowledge.index_path;

        let index = match KnowledgeIndex::load(path, embedder.clone(), options).await {
            Ok(index) => index,
            Err(IndexError::NotFound(_)) => {
                info!(path = %path.display(), "no index found, building from docs root");
                let docs = load_documents(&config.knowledge).map_err(|e| init("knowledge base", &e))?;
                KnowledgeIndex::build(path, embedder, options, &docs)
                    .await
                    .map_err(|e| init("knowledge index", &e))?
            }
            Err(e) => return Err(init("knowledge index", &e)),
        };

        Ok(Self::new(
            llm,
            index,
            KnowledgeLedger::new(&config.knowledge.ledger_path),
            RunSettings::from_config(config),
        ))
    }

    pub fn with_publisher(&self, publisher: PublishPipeline) -> Self {
        Self {
            publisher: Some(publisher),
            ..self.clone()
        }
    }

    /// Same services with a different language model, e.g. a tenant's own.
    pub fn with_language_model(&self, llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            classifier: ChangeClassifier::new(llm.clone()),
            generator: ContentGenerator::new(llm),
            ..self.clone()
        }
    }

    /// Derive services for a tenant's model settings.
    pub fn for_model_config(&self, llm: &LlmConfig) -> Result<Self, PipelineError> {
        let model = create_language_model(llm)
            .map_err(|e| PipelineError::Initialization(format!("tenant language model: {:#}", e)))?;
        Ok(self.with_language_model(model))
    }

    /// Same services over a different index and ledger.
    pub fn with_knowledge(&self, index: KnowledgeIndex, ledger: KnowledgeLedger) -> Self {
        Self {
            retriever: RelevanceRetriever::new(index.clone()),
            index,
            ledger,
            ..self.clone()
        }
    }

    /// Services over the tenant's own index and ledger under
    /// `root/<tenant_id>/`. A tenant seen for the first time starts from an
    /// empty index built with the shared embedder.
    pub async fn for_tenant(&self, root: &Path, tenant_id: &str) -> Result<Self, PipelineError> {
        let (index_path, ledger_path) = tenant_knowledge_paths(root, tenant_id);
        let embedder = self.index.embedder();
        let options = self.index.options();
        let tenant_err =
            |e: IndexError| PipelineError::Initialization(format!("tenant '{}' index: {}", tenant_id, e));

        let index = match KnowledgeIndex::load(&index_path, embedder.clone(), options).await {
            Ok(index) => index,
            Err(IndexError::NotFound(_)) => {
                info!(tenant = tenant_id, path = %index_path.display(), "creating tenant index");
                KnowledgeIndex::build(&index_path, embedder, options, &[])
                    .await
                    .map_err(tenant_err)?
            }
            Err(e) => return Err(tenant_err(e)),
        };
        Ok(self.with_knowledge(index, KnowledgeLedger::new(ledger_path)))
    }

    pub fn ledger_path(&self) -> &Path {
        self.ledger.path()
    }
}

/// Index and ledger files for one tenant.
pub fn tenant_knowledge_paths(root: &Path, tenant_id: &str) -> (PathBuf, PathBuf) {
    let dir = root.join(tenant_id);
    (dir.join("index.sqlite"), dir.join("DOC_LEDGER.md"))
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The classifier judged the diff non-functional.
    TrivialChange { summary: String },
    /// Related docs exist but none cleared the threshold and low-confidence
    /// creation is disabled.
    LowConfidence { confidence: f64 },
    /// Every file write failed.
    NothingToPublish { branch_name: String },
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct PublishedRun {
    pub decision: ConfidenceDecision,
    pub pull_request: PullRequest,
    /// Set when the incremental index update failed; the publish stands.
    pub index_error: Option<String>,
    pub changelog: Option<String>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Skipped(SkipReason),
    Failed(PipelineError),
    Published(PublishedRun),
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Skipped(_) => "skipped",
            RunOutcome::Failed(_) => "failed",
            RunOutcome::Published(_) => "published",
        }
    }
}

/// Output of the side-effect-free half of a run.
#[derive(Debug, Clone)]
pub struct Draft {
    pub verdict: ClassificationVerdict,
    pub retrieval: RetrievalResult,
    pub decision: ConfidenceDecision,
    pub doc: GeneratedDoc,
}

#[derive(Debug, Clone)]
pub enum Drafted {
    Skip(SkipReason),
    Ready(Draft),
}

/// Classify, retrieve, decide and generate. Writes nothing.
#[instrument(skip_all, fields(change_id = %run.change_id, repo = %run.repo_id))]
pub async fn draft(
    services: &Services,
    run: &PipelineRun,
    progress: &ProgressSender,
) -> Result<Drafted, PipelineError> {
    let settings = &services.settings;

    progress.step("Analyzing diff");
    let verdict = services.classifier.classify(&run.diff).await?;
    info!(functional = verdict.is_functional_change, summary = %verdict.analysis_summary, "classified");

    if !verdict.is_functional_change {
        progress.skip(format!("Trivial change: {}", verdict.analysis_summary));
        return Ok(Drafted::Skip(SkipReason::TrivialChange {
            summary: verdict.analysis_summary,
        }));
    }
    progress.step(format!("Functional change: {}", verdict.analysis_summary));

    progress.step("Retrieving related documentation");
    let retrieval = services
        .retriever
        .retrieve(&verdict.analysis_summary, settings.top_k)
        .await?;

    let decision = select(&retrieval, settings.confidence_threshold, &settings.ledger_source);
    info!(mode = %decision.mode, confidence = decision.confidence, targets = ?decision.target_sources, "mode selected");
    progress.step(format!(
        "Mode {} (confidence {:.2}, threshold {:.2})",
        decision.mode, decision.confidence, settings.confidence_threshold
    ));

    if decision.mode == Mode::Create && !retrieval.is_empty() && !settings.create_on_low_confidence {
        progress.skip(format!(
            "Low confidence ({:.2}); not creating a new section",
            decision.confidence
        ));
        return Ok(Drafted::Skip(SkipReason::LowConfidence {
            confidence: decision.confidence,
        }));
    }

    let text = match decision.mode {
        Mode::Update => {
            progress.step("Rewriting existing documentation");
            services
                .generator
                .rewrite(&verdict.analysis_summary, &retrieval.to_context(), &run.diff)
                .await?
        }
        Mode::Create => {
            progress.step("Writing a new documentation section");
            services
                .generator
                .create(&verdict.analysis_summary, &run.diff)
                .await?
        }
    };

    let doc = GeneratedDoc {
        text,
        target_sources: decision.target_sources.clone(),
    };
    Ok(Drafted::Ready(Draft {
        verdict,
        retrieval,
        decision,
        doc,
    }))
}

/// Ledger, index, publish, changelog.
#[instrument(skip_all, fields(change_id = %run.change_id))]
pub async fn commit(
    services: &Services,
    run: &PipelineRun,
    draft: Draft,
    progress: &ProgressSender,
) -> Result<RunOutcome, PipelineError> {
    let publisher = services.publisher.as_ref().ok_or_else(|| {
        PipelineError::Initialization("no repository host configured for publishing".to_string())
    })?;
    let ledger_source = &services.settings.ledger_source;

    progress.step("Appending to knowledge ledger");
    let ledger_entry = services.ledger.append(&draft.doc, Utc::now()).await?;

    progress.step("Updating knowledge index");
    let index_error = match add_to_index(services, ledger_source, &draft.doc.text).await {
        Ok(stats) => {
            info!(added = stats.chunks_added, "index updated");
            None
        }
        Err(e) => {
            let err = PipelineError::IndexWrite(e);
            error!(error = %err, "knowledge index update failed; ledger and publish unaffected");
            progress.error(format!("Index update failed: {}", err));
            Some(err.to_string())
        }
    };

    progress.step(format!("Publishing to {}", publisher.repo()));
    let request = PublishRequest {
        change_id: run.change_id.clone(),
        change_title: run.title.clone(),
        summary: draft.verdict.analysis_summary.clone(),
        decision: draft.decision.clone(),
        content: PublishContent {
            document: draft.doc.text.clone(),
            ledger_entry,
        },
    };
    let pull_request = match publisher.publish(&request, progress).await? {
        PublishOutcome::Opened(pr) => pr,
        PublishOutcome::NothingToPublish { branch_name, .. } => {
            return Ok(RunOutcome::Skipped(SkipReason::NothingToPublish { branch_name }));
        }
    };

    let changelog = match services
        .generator
        .summarize_changelog(&run.author, &draft.verdict.analysis_summary, &run.diff)
        .await
    {
        Ok(line) => {
            progress.action(format!("Changelog: {}", line));
            Some(line)
        }
        Err(e) => {
            warn!(error = %e, "changelog summary failed");
            None
        }
    };

    Ok(RunOutcome::Published(PublishedRun {
        decision: draft.decision,
        pull_request,
        index_error,
        changelog,
    }))
}

async fn add_to_index(
    services: &Services,
    ledger_source: &str,
    text: &str,
) -> Result<IndexStats, IndexError> {
    services
        .index
        .add(&[Document::new(ledger_source, text)])
        .await
}

/// Run the full pipeline. Never returns an error: failures become
/// [`RunOutcome::Failed`].
pub async fn run(services: &Services, run: &PipelineRun, progress: &ProgressSender) -> RunOutcome {
    progress.trigger(format!(
        "Change {} in {} by {}: {}",
        run.change_id, run.repo_id, run.author, run.title
    ));

    let result = match draft(services, run, progress).await {
        Ok(Drafted::Skip(reason)) => Ok(RunOutcome::Skipped(reason)),
        Ok(Drafted::Ready(d)) => commit(services, run, d, progress).await,
        Err(e) => Err(e),
    };

    let outcome = result.unwrap_or_else(RunOutcome::Failed);
    match &outcome {
        RunOutcome::Failed(e) => {
            error!(change_id = %run.change_id, kind = e.kind(), error = %e, "run failed");
            progress.error(format!("Run failed ({}): {}", e.kind(), e));
        }
        RunOutcome::Skipped(reason) => {
            info!(change_id = %run.change_id, ?reason, "run skipped");
        }
        RunOutcome::Published(p) => {
            info!(change_id = %run.change_id, url = %p.pull_request.url, "run published");
            progress.action(format!("Done: {}", p.pull_request.url));
        }
    }
    outcome
}
