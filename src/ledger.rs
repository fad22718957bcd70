//! Append-only knowledge ledger.
//!
//! Every generated entry is appended to a single Markdown file as
//!
//! ```text
//!
//!
//! ---
//!
//! ### AI-Generated Update (2025-01-31 14:02:11 UTC)
//!
//! <generated text>
//! ```
//!
//! Appends never touch earlier bytes. Each append writes the previous
//! contents plus the new entry to a sibling temp file, syncs it, and
//! renames it over the ledger, so a concurrent reader sees either the old
//! file or the new one. Appends are serialized per ledger handle and run
//! on the blocking pool.

use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::PipelineError;
use crate::models::GeneratedDoc;

/// Render one ledger entry. Shared by the local ledger and the published
/// copy so both stay byte-identical.
pub fn format_entry(text: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "\n\n---\n\n### AI-Generated Update ({})\n\n{}\n",
        timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        text.trim_end()
    )
}

#[derive(Clone)]
pub struct KnowledgeLedger {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl KnowledgeLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append `entry` stamped with `timestamp`. Returns the exact
    /// text appended.
    pub async fn append(
        &self,
        entry: &GeneratedDoc,
        timestamp: DateTime<Utc>,
    ) -> Result<String, PipelineError> {
        let rendered = format_entry(&entry.text, timestamp);
        let _guard = self.lock.lock().await;

        let path = self.path.clone();
        let block = rendered.clone();
        tokio::task::spawn_blocking(move || append_atomic(&path, &block))
            .await
            .map_err(|e| PipelineError::Ledger {
                path: self.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?
            .map_err(|source| PipelineError::Ledger {
                path: self.path.clone(),
                source,
            })?;

        info!(path = %self.path.display(), bytes = rendered.len(), "ledger entry appended");
        Ok(rendered)
    }

    /// Current ledger contents; empty when the file does not exist yet.
    pub async fn read(&self) -> Result<String, PipelineError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(PipelineError::Ledger {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

fn append_atomic(path: &Path, block: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let existing = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&existing)?;
        file.write_all(block.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}
