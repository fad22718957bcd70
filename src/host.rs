//! Remote repository host.
//!
//! [`RepoHost`] is the narrow set of operations the publish workflow needs:
//! resolve a branch head, create a branch, read and write a file on a
//! branch, and open a pull request. Two implementations:
//!
//! - [`GitHubHost`]: the GitHub REST API v3 (`/repos/{owner}/{repo}/...`).
//! - [`InMemoryHost`]: a process-local repository with failure injection
//!   and call counters, used by the test suites.

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Result of asking the host to create a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    Created,
    AlreadyExists,
}

/// A file as stored on the host at some ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Revision marker required to overwrite the file.
    pub sha: String,
    pub content: String,
}

#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Repository identifier, `owner/name`.
    fn repo(&self) -> &str;
    async fn default_branch(&self) -> Result<String>;
    /// Commit sha at the tip of `branch`.
    async fn branch_head(&self, branch: &str) -> Result<String>;
    async fn create_branch(&self, branch: &str, from_sha: &str) -> Result<BranchOutcome>;
    /// `None` when the file does not exist at `git_ref`.
    async fn get_file(&self, path: &str, git_ref: &str) -> Result<Option<RemoteFile>>;
    /// Create or overwrite `path` on `branch`. `sha` must be the current
    /// revision marker when the file already exists.
    async fn put_file(
        &self,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
        sha: Option<&str>,
    ) -> Result<()>;
    /// Open a pull request and return its URL. Opening a second pull
    /// request for the same head returns the existing one.
    async fn create_pull_request(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String>;
}

// ============ GitHub ============

pub struct GitHubHost {
    api_url: String,
    repo: String,
    token: String,
    client: reqwest::Client,
}

impl GitHubHost {
    pub fn new(
        api_url: &str,
        repo: &str,
        token: &str,
        user_agent: &str,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
            client,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/repos/{}{}", self.api_url, self.repo, suffix)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self.request(reqwest::Method::GET, url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("GitHub API error {} for GET {}: {}", status, url, text);
        }
        Ok(response.json().await?)
    }

    async fn find_open_pull_request(&self, head: &str) -> Result<Option<String>> {
        let owner = self.repo.split('/').next().unwrap_or_default();
        let url = format!(
            "{}?state=open&head={}:{}",
            self.url("/pulls"),
            owner,
            head
        );
        let json = self.get_json(&url).await?;
        Ok(json
            .as_array()
            .and_then(|prs| prs.first())
            .and_then(|pr| pr.get("html_url"))
            .and_then(|u| u.as_str())
            .map(str::to_string))
    }
}

#[derive(Serialize)]
struct PutContents<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[async_trait]
impl RepoHost for GitHubHost {
    fn repo(&self) -> &str {
        &self.repo
    }

    async fn default_branch(&self) -> Result<String> {
        let json = self.get_json(&self.url("")).await?;
        json.get("default_branch")
            .and_then(|b| b.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("GitHub repository response missing default_branch"))
    }

    async fn branch_head(&self, branch: &str) -> Result<String> {
        let json = self
            .get_json(&self.url(&format!("/git/ref/heads/{}", branch)))
            .await?;
        json.pointer("/object/sha")
            .and_then(|s| s.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("GitHub ref response missing object.sha"))
    }

    async fn create_branch(&self, branch: &str, from_sha: &str) -> Result<BranchOutcome> {
        let response = self
            .request(reqwest::Method::POST, &self.url("/git/refs"))
            .json(&serde_json::json!({
                "ref": format!("refs/heads/{}", branch),
                "sha": from_sha,
            }))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(BranchOutcome::Created);
        }
        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::UNPROCESSABLE_ENTITY && text.contains("Reference already exists") {
            debug!(branch, "branch already exists");
            return Ok(BranchOutcome::AlreadyExists);
        }
        bail!("GitHub API error {} creating branch {}: {}", status, branch, text)
    }

    async fn get_file(&self, path: &str, git_ref: &str) -> Result<Option<RemoteFile>> {
        let url = format!("{}?ref={}", self.url(&format!("/contents/{}", path)), git_ref);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("GitHub API error {} reading {}: {}", status, path, text);
        }

        let json: serde_json::Value = response.json().await?;
        let sha = json
            .get("sha")
            .and_then(|s| s.as_str())
            .ok_or_else(|| anyhow::anyhow!("GitHub contents response missing sha"))?
            .to_string();
        let encoded: String = json
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = STANDARD.decode(encoded)?;
        Ok(Some(RemoteFile {
            sha,
            content: String::from_utf8_lossy(&bytes).into_owned(),
        }))
    }

    async fn put_file(
        &self,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
        sha: Option<&str>,
    ) -> Result<()> {
        let body = PutContents {
            message,
            content: STANDARD.encode(content.as_bytes()),
            branch,
            sha,
        };
        let response = self
            .request(reqwest::Method::PUT, &self.url(&format!("/contents/{}", path)))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("GitHub API error {} writing {}: {}", status, path, text);
        }
        Ok(())
    }

    async fn create_pull_request(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let response = self
            .request(reqwest::Method::POST, &self.url("/pulls"))
            .json(&serde_json::json!({
                "title": title,
                "head": head,
                "base": base,
                "body": body,
            }))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response.json().await?;
            return json
                .get("html_url")
                .and_then(|u| u.as_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("GitHub pull request response missing html_url"));
        }

        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::UNPROCESSABLE_ENTITY && text.contains("already exists") {
            if let Some(url) = self.find_open_pull_request(head).await? {
                debug!(head, %url, "pull request already open");
                return Ok(url);
            }
        }
        bail!("GitHub API error {} opening pull request: {}", status, text)
    }
}

// ============ In-memory ============

/// A pull request recorded by [`InMemoryHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
    pub url: String,
}

#[derive(Default)]
struct MemoryState {
    default_branch: String,
    /// branch -> head sha
    heads: HashMap<String, String>,
    /// (branch, path) -> file
    files: HashMap<(String, String), RemoteFile>,
    pulls: Vec<RecordedPullRequest>,
    next_sha: u64,
    failing_paths: HashSet<String>,
    fail_branches: bool,
    fail_pulls: bool,
    calls: usize,
    writes: usize,
}

impl MemoryState {
    fn fresh_sha(&mut self) -> String {
        self.next_sha += 1;
        format!("{:040x}", self.next_sha)
    }
}

/// Process-local repository host.
pub struct InMemoryHost {
    repo: String,
    state: Mutex<MemoryState>,
}

impl InMemoryHost {
    pub fn new(repo: &str, default_branch: &str) -> Self {
        let mut state = MemoryState {
            default_branch: default_branch.to_string(),
            ..Default::default()
        };
        let sha = state.fresh_sha();
        state.heads.insert(default_branch.to_string(), sha);
        Self {
            repo: repo.to_string(),
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a file on `branch`.
    pub fn with_file(self, branch: &str, path: &str, content: &str) -> Self {
        {
            let mut state = self.state();
            let sha = state.fresh_sha();
            state.files.insert(
                (branch.to_string(), path.to_string()),
                RemoteFile {
                    sha,
                    content: content.to_string(),
                },
            );
        }
        self
    }

    /// Make every write to `path` fail.
    pub fn fail_writes_to(&self, path: &str) {
        self.state().failing_paths.insert(path.to_string());
    }

    pub fn fail_branch_creation(&self) {
        self.state().fail_branches = true;
    }

    pub fn fail_pull_requests(&self) {
        self.state().fail_pulls = true;
    }

    pub fn branches(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().heads.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn file(&self, branch: &str, path: &str) -> Option<String> {
        self.state()
            .files
            .get(&(branch.to_string(), path.to_string()))
            .map(|f| f.content.clone())
    }

    pub fn pull_requests(&self) -> Vec<RecordedPullRequest> {
        self.state().pulls.clone()
    }

    /// Total number of host operations invoked.
    pub fn call_count(&self) -> usize {
        self.state().calls
    }

    /// Number of successful file writes.
    pub fn write_count(&self) -> usize {
        self.state().writes
    }
}

#[async_trait]
impl RepoHost for InMemoryHost {
    fn repo(&self) -> &str {
        &self.repo
    }

    async fn default_branch(&self) -> Result<String> {
        let mut state = self.state();
        state.calls += 1;
        Ok(state.default_branch.clone())
    }

    async fn branch_head(&self, branch: &str) -> Result<String> {
        let mut state = self.state();
        state.calls += 1;
        state
            .heads
            .get(branch)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("branch not found: {}", branch))
    }

    async fn create_branch(&self, branch: &str, from_sha: &str) -> Result<BranchOutcome> {
        let mut state = self.state();
        state.calls += 1;
        if state.fail_branches {
            bail!("injected branch failure");
        }
        if state.heads.contains_key(branch) {
            return Ok(BranchOutcome::AlreadyExists);
        }
        let source = state
            .heads
            .iter()
            .find(|(_, sha)| sha.as_str() == from_sha)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown commit {}", from_sha))?;

        let copied: Vec<((String, String), RemoteFile)> = state
            .files
            .iter()
            .filter(|((b, _), _)| *b == source)
            .map(|((_, p), f)| ((branch.to_string(), p.clone()), f.clone()))
            .collect();
        state.files.extend(copied);
        state.heads.insert(branch.to_string(), from_sha.to_string());
        Ok(BranchOutcome::Created)
    }

    async fn get_file(&self, path: &str, git_ref: &str) -> Result<Option<RemoteFile>> {
        let mut state = self.state();
        state.calls += 1;
        Ok(state
            .files
            .get(&(git_ref.to_string(), path.to_string()))
            .cloned())
    }

    async fn put_file(
        &self,
        path: &str,
        branch: &str,
        content: &str,
        _message: &str,
        sha: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state();
        state.calls += 1;
        if state.failing_paths.contains(path) {
            bail!("injected write failure for {}", path);
        }
        if !state.heads.contains_key(branch) {
            bail!("branch not found: {}", branch);
        }
        let key = (branch.to_string(), path.to_string());
        if let Some(existing) = state.files.get(&key) {
            if sha != Some(existing.sha.as_str()) {
                bail!("sha mismatch for {}", path);
            }
        }
        let new_sha = state.fresh_sha();
        state.files.insert(
            key,
            RemoteFile {
                sha: new_sha.clone(),
                content: content.to_string(),
            },
        );
        state.heads.insert(branch.to_string(), new_sha);
        state.writes += 1;
        Ok(())
    }

    async fn create_pull_request(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let mut state = self.state();
        state.calls += 1;
        if state.fail_pulls {
            bail!("injected pull request failure");
        }
        if let Some(existing) = state.pulls.iter().find(|pr| pr.head == head) {
            return Ok(existing.url.clone());
        }
        let url = format!("https://example.test/{}/pull/{}", self.repo, state.pulls.len() + 1);
        state.pulls.push(RecordedPullRequest {
            head: head.to_string(),
            base: base.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            url: url.clone(),
        });
        Ok(url)
    }
}
