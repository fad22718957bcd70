//! Knowledge base loading.
//!
//! Walks `knowledge.docs_root` and returns one [`Document`] per matching
//! file. Each document's `source_path` is its canonical path inside the
//! published repository (`repo_prefix` + path relative to the docs root,
//! always with `/` separators), fixed here once and carried unchanged
//! through chunking, retrieval, and publishing.
//!
//! The local ledger file is always loaded under the configured
//! `ledger_source`, even when it lives outside the docs root.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::KnowledgeConfig;
use crate::models::Document;

pub fn load_documents(config: &KnowledgeConfig) -> Result<Vec<Document>> {
    let root = &config.docs_root;
    if !root.exists() {
        bail!("knowledge.docs_root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec!["**/.git/**".to_string(), "**/node_modules/**".to_string()];
    excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let ledger = std::fs::canonicalize(&config.ledger_path).ok();
    let mut docs = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if ledger.is_some() && std::fs::canonicalize(path).ok() == ledger {
            continue;
        }

        let relative = relative_slash_path(root, path);
        if exclude_set.is_match(&relative) || !include_set.is_match(&relative) {
            continue;
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };
        docs.push(Document::new(repo_path(&config.repo_prefix, &relative), content));
    }

    if config.ledger_path.exists() {
        let content = std::fs::read_to_string(&config.ledger_path)?;
        docs.push(Document::new(config.ledger_source.clone(), content));
    }

    docs.sort_by(|a, b| a.source_path.cmp(&b.source_path));
    Ok(docs)
}

/// Join a repository prefix and a relative path with exactly one `/`.
pub fn repo_path(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}

fn relative_slash_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
