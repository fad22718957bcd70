//! `docsync index` subcommands: build, query, add, remove.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::{Config, KnowledgeConfig};
use crate::docs_loader::{load_documents, repo_path};
use crate::embedding::create_embedder;
use crate::index::{IndexOptions, KnowledgeIndex};
use crate::mode::select;
use crate::models::Document;

/// Rebuild the index from everything under `knowledge.docs_root`.
pub async fn run_build(config: &Config) -> Result<()> {
    let docs = load_documents(&config.knowledge)?;
    let embedder = create_embedder(&config.embedding)?;
    let index = KnowledgeIndex::build(
        &config.knowledge.index_path,
        embedder,
        IndexOptions::from_config(config),
        &docs,
    )
    .await?;

    println!("index build");
    println!("  documents: {}", docs.len());
    println!("  chunks: {}", index.count().await?);
    println!("  path: {}", config.knowledge.index_path.display());
    Ok(())
}

async fn open_index(config: &Config) -> Result<KnowledgeIndex> {
    let embedder = create_embedder(&config.embedding)?;
    KnowledgeIndex::load(
        &config.knowledge.index_path,
        embedder,
        IndexOptions::from_config(config),
    )
    .await
    .with_context(|| "Failed to open knowledge index (run `docsync index build` first)")
}

/// Print the top `k` chunks for `text` and the mode they would select.
pub async fn run_query(config: &Config, text: &str, k: Option<usize>, json: bool) -> Result<()> {
    let index = open_index(config).await?;
    let k = k.unwrap_or(config.retrieval.top_k);
    let result = index.query(text, k).await?;
    let decision = select(
        &result,
        config.retrieval.confidence_threshold,
        &config.knowledge.ledger_source,
    );

    if json {
        let out = serde_json::json!({ "results": result.hits, "decision": decision });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if result.is_empty() {
        println!("No results.");
    }
    for (i, hit) in result.hits.iter().enumerate() {
        let snippet: String = hit
            .chunk
            .content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(120)
            .collect();
        println!(
            "{}. [{:.3}] {}#{}",
            i + 1,
            hit.score,
            hit.chunk.source_path,
            hit.chunk.chunk_index
        );
        println!("    {}", snippet);
    }
    println!(
        "decision: {} (confidence {:.3}, threshold {:.2})",
        decision.mode, decision.confidence, config.retrieval.confidence_threshold
    );
    Ok(())
}

/// Repository path for a local file: relative to the docs root when the
/// file lives under it, otherwise just its file name under the prefix.
pub fn source_path_for(knowledge: &KnowledgeConfig, file: &Path) -> String {
    if file == knowledge.ledger_path {
        return knowledge.ledger_source.clone();
    }
    let relative = match file.strip_prefix(&knowledge.docs_root) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file.to_string_lossy().to_string()),
    };
    repo_path(&knowledge.repo_prefix, &relative)
}

/// Add files to an existing index without re-embedding what it holds.
pub async fn run_add(config: &Config, files: &[std::path::PathBuf]) -> Result<()> {
    let index = open_index(config).await?;

    let mut docs = Vec::with_capacity(files.len());
    for file in files {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        docs.push(Document::new(source_path_for(&config.knowledge, file), content));
    }
    let stats = index.add(&docs).await?;

    println!("index add");
    println!("  documents: {}", stats.documents);
    println!("  chunks added: {}", stats.chunks_added);
    println!("  chunks skipped: {}", stats.chunks_skipped);
    println!("  total chunks: {}", index.count().await?);
    Ok(())
}

pub async fn run_remove(config: &Config, source_path: &str) -> Result<()> {
    let index = open_index(config).await?;
    let removed = index.remove(source_path).await?;
    println!("index remove");
    println!("  {}: {} chunk(s) removed", source_path, removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn knowledge() -> KnowledgeConfig {
        KnowledgeConfig {
            docs_root: PathBuf::from("/srv/kb"),
            repo_prefix: "docs/".to_string(),
            ledger_path: PathBuf::from("/srv/kb/DOC_LEDGER.md"),
            ledger_source: "docs/DOC_LEDGER.md".to_string(),
            index_path: PathBuf::from("/srv/index.sqlite"),
            include_globs: vec!["**/*.md".to_string()],
            exclude_globs: vec![],
        }
    }

    #[test]
    fn test_source_path_for() {
        let kb = knowledge();
        assert_eq!(
            source_path_for(&kb, Path::new("/srv/kb/guides/setup.md")),
            "docs/guides/setup.md"
        );
        assert_eq!(source_path_for(&kb, Path::new("/tmp/notes.md")), "docs/notes.md");
        assert_eq!(
            source_path_for(&kb, Path::new("/srv/kb/DOC_LEDGER.md")),
            "docs/DOC_LEDGER.md"
        );
    }
}
