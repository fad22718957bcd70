//! Bootstrapping an empty knowledge base from source code.

use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::docs_loader::build_globset;
use crate::models::{Document, GeneratedDoc};
use crate::pipeline::Services;

/// Files considered project source when seeding.
pub const DEFAULT_SOURCE_GLOBS: &[&str] = &[
    "**/*.rs", "**/*.py", "**/*.go", "**/*.ts", "**/*.js", "**/*.java", "**/*.rb", "**/*.toml",
    "**/*.md",
];

/// Upper bound on source text handed to the language model.
pub const MAX_SOURCE_BYTES: usize = 200_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub files_read: usize,
    pub truncated: bool,
    pub chunks_indexed: usize,
}

/// Concatenate matching files under `dir`, each prefixed with its path,
/// stopping once `max_bytes` would be exceeded. Returns the text, the
/// number of files included, and whether anything was left out.
pub fn collect_sources(dir: &Path, globs: &[String], max_bytes: usize) -> Result<(String, usize, bool)> {
    let include = build_globset(globs)?;
    let exclude = build_globset(&[
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ])?;

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if exclude.is_match(&rel) || !include.is_match(&rel) {
            continue;
        }
        paths.push((rel, entry.path().to_path_buf()));
    }
    paths.sort();

    let mut out = String::new();
    let mut files = 0;
    let mut truncated = false;
    for (rel, path) in paths {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let block = format!("// File: {}\n{}\n\n", rel, content);
        if out.len() + block.len() > max_bytes {
            truncated = true;
            continue;
        }
        out.push_str(&block);
        files += 1;
    }
    Ok((out, files, truncated))
}

/// Generate a project overview from `dir`, append it to the ledger, and
/// index it under the ledger's repository path.
pub async fn run_seed(services: &Services, dir: &Path) -> Result<SeedReport> {
    let globs: Vec<String> = DEFAULT_SOURCE_GLOBS.iter().map(|s| s.to_string()).collect();
    let (source, files_read, truncated) = collect_sources(dir, &globs, MAX_SOURCE_BYTES)?;
    if files_read == 0 {
        anyhow::bail!("no source files found under {}", dir.display());
    }
    if truncated {
        warn!(limit = MAX_SOURCE_BYTES, "source exceeded the seed limit; some files were left out");
    }

    let overview = services.generator.seed_overview(&source).await?;
    let ledger_source = services.settings.ledger_source.clone();
    let doc = GeneratedDoc {
        text: overview.clone(),
        target_sources: BTreeSet::from([ledger_source.clone()]),
    };
    services.ledger.append(&doc, Utc::now()).await?;
    let stats = services
        .index
        .add(&[Document::new(ledger_source, overview)])
        .await?;

    info!(files_read, chunks = stats.chunks_added, "knowledge base seeded");
    Ok(SeedReport {
        files_read,
        truncated,
        chunks_indexed: stats.chunks_added,
    })
}
