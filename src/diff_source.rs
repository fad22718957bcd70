//! Resolving a change's diff text.

use anyhow::{bail, Result};
use std::time::Duration;
use tracing::debug;

/// Where a change's diff comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffSource {
    Text(String),
    /// A URL serving the unified diff (`.diff` links, compare URLs).
    Url(String),
}

pub struct DiffFetcher {
    client: reqwest::Client,
    token: Option<String>,
}

impl DiffFetcher {
    pub fn new(token: Option<String>, user_agent: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client, token })
    }

    pub async fn resolve(&self, source: &DiffSource) -> Result<String> {
        match source {
            DiffSource::Text(text) => Ok(text.clone()),
            DiffSource::Url(url) => self.fetch(url).await,
        }
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let mut req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github.v3.diff");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("diff fetch failed with {} for {}", status, url);
        }
        let text = response.text().await?;
        debug!(url, bytes = text.len(), "diff fetched");
        Ok(text)
    }
}
