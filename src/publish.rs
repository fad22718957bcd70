//! Branch → files → pull request workflow.
//!
//! ```text
//! START ─▶ BRANCH_ENSURED ─▶ FILES_UPDATED ─▶ PR_OPENED ─▶ DONE
//!   └──────────┴──────────────────┴───────────────┴──▶ FAILED(reason)
//! ```
//!
//! Every step is safe to repeat. The branch name is a pure function of the
//! change id, an existing branch counts as success, each file write
//! carries the branch's current revision marker, and the ledger file is
//! always rebuilt from the base branch plus the new entry, so a rerun
//! converges on the same tree instead of appending twice.
//!
//! Only paths that already exist on the base branch are rewritten. A
//! target missing there is a per-file failure, never a new file. The
//! ledger is the one exception: it is created when absent, and it is
//! published whenever the request carries a ledger entry, so the remote
//! ledger always holds what the local index was extended with.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::PublishError;
use crate::host::{BranchOutcome, RepoHost};
use crate::models::{ConfidenceDecision, Mode};
use crate::progress::ProgressSender;

/// Appended to the body of low-confidence CREATE pull requests.
pub const LOW_CONFIDENCE_WARNING: &str = "⚠️ **Low confidence:** related documentation was found \
but did not match this change closely enough to revise it, so a new section was added to the \
ledger instead. Please check whether an existing page should be updated.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    Start,
    BranchEnsured,
    FilesUpdated,
    PrOpened,
    Done,
    Failed(String),
}

impl std::fmt::Display for PublishState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishState::Start => write!(f, "START"),
            PublishState::BranchEnsured => write!(f, "BRANCH_ENSURED"),
            PublishState::FilesUpdated => write!(f, "FILES_UPDATED"),
            PublishState::PrOpened => write!(f, "PR_OPENED"),
            PublishState::Done => write!(f, "DONE"),
            PublishState::Failed(reason) => write!(f, "FAILED({})", reason),
        }
    }
}

/// What to write. Paths equal to the ledger source receive the base
/// branch's ledger plus `ledger_entry`; every other path is replaced with
/// `document`.
#[derive(Debug, Clone)]
pub struct PublishContent {
    pub document: String,
    pub ledger_entry: String,
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub change_id: String,
    pub change_title: String,
    pub summary: String,
    pub decision: ConfidenceDecision,
    pub content: PublishContent,
}

/// Publish output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub title: String,
    pub body: String,
    pub branch_name: String,
    pub updated_files: Vec<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Opened(PullRequest),
    /// Every file write failed; no pull request was opened.
    NothingToPublish { branch_name: String, failed: Vec<String> },
}

/// Per-file results of `update_files`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesReport {
    pub updated: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Deterministic branch for a change: `prefix` + the change id with
/// anything outside `[A-Za-z0-9._-]` replaced by `-`.
pub fn branch_name(prefix: &str, change_id: &str) -> String {
    let sanitized: String = change_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}{}", prefix, sanitized.trim_matches('-'))
}

pub fn pull_request_title(change_title: &str, change_id: &str) -> String {
    format!("docs: AI update for '{}' (change {})", change_title, change_id)
}

pub fn pull_request_body(request: &PublishRequest, updated_files: &[String]) -> String {
    let mut body = format!(
        "This pull request was generated automatically for change `{}` ({}).\n\n\
         **Analysis:** {}\n\n\
         **Mode:** {} (confidence {:.2})\n\n\
         **Updated files:**\n",
        request.change_id,
        request.change_title,
        request.summary,
        request.decision.mode,
        request.decision.confidence
    );
    for path in updated_files {
        body.push_str(&format!("- `{}`\n", path));
    }
    if request.decision.mode == Mode::Create && request.decision.confidence > 0.0 {
        body.push('\n');
        body.push_str(LOW_CONFIDENCE_WARNING);
        body.push('\n');
    }
    body
}

#[derive(Clone)]
pub struct PublishPipeline {
    host: Arc<dyn RepoHost>,
    branch_prefix: String,
    ledger_source: String,
}

impl PublishPipeline {
    pub fn new(host: Arc<dyn RepoHost>, branch_prefix: &str, ledger_source: &str) -> Self {
        Self {
            host,
            branch_prefix: branch_prefix.to_string(),
            ledger_source: ledger_source.to_string(),
        }
    }

    pub fn repo(&self) -> &str {
        self.host.repo()
    }

    pub fn branch_for(&self, change_id: &str) -> String {
        branch_name(&self.branch_prefix, change_id)
    }

    /// Create `branch_name` at the head of `base_ref`. An existing branch
    /// is success.
    pub async fn ensure_branch(&self, base_ref: &str, branch_name: &str) -> Result<BranchOutcome, PublishError> {
        let branch_err = |e: anyhow::Error| PublishError::Branch {
            branch: branch_name.to_string(),
            message: format!("{:#}", e),
        };
        let head = self.host.branch_head(base_ref).await.map_err(branch_err)?;
        self.host
            .create_branch(branch_name, &head)
            .await
            .map_err(branch_err)
    }

    /// Write `content` to each target on `branch_name`. A failing path is
    /// logged and skipped; the others still land.
    pub async fn update_files(
        &self,
        branch_name: &str,
        base_ref: &str,
        target_sources: &BTreeSet<String>,
        content: &PublishContent,
        commit_message: &str,
    ) -> FilesReport {
        let mut report = FilesReport::default();
        for path in target_sources {
            match self
                .update_one(branch_name, base_ref, path, content, commit_message)
                .await
            {
                Ok(()) => {
                    info!(path = %path, branch = branch_name, "file updated");
                    report.updated.push(path.clone());
                }
                Err(e) => {
                    warn!(path = %path, branch = branch_name, error = %e, "file update failed, skipping");
                    report.failed.push((path.clone(), e.to_string()));
                }
            }
        }
        report
    }

    async fn update_one(
        &self,
        branch_name: &str,
        base_ref: &str,
        path: &str,
        content: &PublishContent,
        commit_message: &str,
    ) -> Result<(), PublishError> {
        let file_err = |e: anyhow::Error| PublishError::File {
            path: path.to_string(),
            message: format!("{:#}", e),
        };
        let base = self.host.get_file(path, base_ref).await.map_err(file_err)?;
        let text = if path == self.ledger_source {
            let mut text = base.map(|f| f.content).unwrap_or_default();
            text.push_str(&content.ledger_entry);
            text
        } else if base.is_none() {
            return Err(PublishError::File {
                path: path.to_string(),
                message: format!("target does not exist on {}", base_ref),
            });
        } else {
            content.document.clone()
        };
        let current = self.host.get_file(path, branch_name).await.map_err(file_err)?;

        self.host
            .put_file(
                path,
                branch_name,
                &text,
                commit_message,
                current.as_ref().map(|f| f.sha.as_str()),
            )
            .await
            .map_err(file_err)
    }

    /// Open the pull request. Callers only reach this with at least one
    /// updated file.
    pub async fn open_pull_request(
        &self,
        branch_name: &str,
        base_ref: &str,
        title: &str,
        body: &str,
    ) -> Result<String, PublishError> {
        self.host
            .create_pull_request(branch_name, base_ref, title, body)
            .await
            .map_err(|e| PublishError::PullRequest {
                branch: branch_name.to_string(),
                message: format!("{:#}", e),
            })
    }

    /// Paths to write for `request`: the decision's targets plus the
    /// ledger when there is an entry to append.
    pub fn targets_for(&self, request: &PublishRequest) -> BTreeSet<String> {
        let mut targets = request.decision.target_sources.clone();
        if !request.content.ledger_entry.is_empty() {
            targets.insert(self.ledger_source.clone());
        }
        targets
    }

    /// Run the whole workflow, reporting each transition.
    #[instrument(skip_all, fields(repo = self.host.repo(), change_id = %request.change_id))]
    pub async fn publish(
        &self,
        request: &PublishRequest,
        progress: &ProgressSender,
    ) -> Result<PublishOutcome, PublishError> {
        let mut state = PublishState::Start;
        let result = self.drive(request, progress, &mut state).await;
        if let Err(e) = &result {
            let failed = PublishState::Failed(e.to_string());
            warn!(from = %state, "publish failed");
            progress.error(format!("Publish {}", failed));
        }
        result
    }

    async fn drive(
        &self,
        request: &PublishRequest,
        progress: &ProgressSender,
        state: &mut PublishState,
    ) -> Result<PublishOutcome, PublishError> {
        let branch = self.branch_for(&request.change_id);
        let base = self
            .host
            .default_branch()
            .await
            .map_err(|e| PublishError::Host(format!("{:#}", e)))?;

        match self.ensure_branch(&base, &branch).await? {
            BranchOutcome::Created => progress.action(format!("Created branch {}", branch)),
            BranchOutcome::AlreadyExists => {
                progress.action(format!("Branch {} already exists, reusing it", branch))
            }
        }
        *state = PublishState::BranchEnsured;

        let title = pull_request_title(&request.change_title, &request.change_id);
        let report = self
            .update_files(
                &branch,
                &base,
                &self.targets_for(request),
                &request.content,
                &title,
            )
            .await;
        for (path, reason) in &report.failed {
            progress.error(format!("Could not update {}: {}", path, reason));
        }
        *state = PublishState::FilesUpdated;

        if report.updated.is_empty() {
            progress.skip("No files were updated; nothing to publish");
            return Ok(PublishOutcome::NothingToPublish {
                branch_name: branch,
                failed: report.failed.into_iter().map(|(p, _)| p).collect(),
            });
        }
        progress.action(format!(
            "Updated {} file(s): {}",
            report.updated.len(),
            report.updated.join(", ")
        ));

        let body = pull_request_body(request, &report.updated);
        let url = self.open_pull_request(&branch, &base, &title, &body).await?;
        *state = PublishState::PrOpened;
        progress.action(format!("Opened pull request {}", url));

        *state = PublishState::Done;
        Ok(PublishOutcome::Opened(PullRequest {
            title,
            body,
            branch_name: branch,
            updated_files: report.updated,
            url,
        }))
    }
}
