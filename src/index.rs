//! Persistent semantic index over document chunks.
//!
//! Backed by a single SQLite file (WAL mode) with two tables:
//!
//! - `chunks`: one row per indexed chunk with its content hash and
//!   embedding vector stored as a little-endian `f32` BLOB.
//! - `index_meta`: the embedding model and dimensionality the index was
//!   built with.
//!
//! [`KnowledgeIndex`] is a cheap, cloneable handle. Every query reads the
//! current table contents, so a handle captured before an [`add`] sees the
//! new chunks afterwards. Writers (`rebuild`, `add`, `remove`) are
//! serialized by a mutex held for the duration of one transaction; readers
//! never take it and see either the previous or the new committed state.
//!
//! [`add`]: KnowledgeIndex::add

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::chunk::chunk_document;
use crate::config::Config;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_batched, embed_query, vec_to_blob, Embedder};
use crate::error::IndexError;
use crate::models::{Document, DocumentChunk, RetrievalResult, ScoredChunk};

/// Chunking and batching parameters applied when documents enter the index.
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub batch_size: usize,
}

impl IndexOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_chars: config.chunking.max_chars,
            overlap_chars: config.chunking.overlap_chars,
            batch_size: config.embedding.batch_size,
        }
    }
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap_chars: 100,
            batch_size: 64,
        }
    }
}

/// Counts reported after a write.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks_added: usize,
    pub chunks_skipped: usize,
}

#[derive(Clone)]
pub struct KnowledgeIndex {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    options: IndexOptions,
    write_lock: Mutex<()>,
}

struct PendingChunk {
    chunk: DocumentChunk,
    hash: String,
}

impl KnowledgeIndex {
    /// Create (or overwrite) the index at `path` from `documents`.
    ///
    /// An empty document set produces a valid, empty index.
    #[instrument(skip_all, fields(path = %path.display(), documents = documents.len()))]
    pub async fn build(
        path: &Path,
        embedder: Arc<dyn Embedder>,
        options: IndexOptions,
        documents: &[Document],
    ) -> Result<Self, IndexError> {
        let pool = connect(path, true).await?;
        migrate(&pool).await?;

        let index = Self::from_parts(path, pool, embedder, options);
        index.rebuild(documents).await?;
        Ok(index)
    }

    /// Open a previously built index.
    ///
    /// Returns [`IndexError::NotFound`] when no index has been built at
    /// `path`, which callers must not confuse with an index holding zero
    /// chunks.
    pub async fn load(
        path: &Path,
        embedder: Arc<dyn Embedder>,
        options: IndexOptions,
    ) -> Result<Self, IndexError> {
        if !path.exists() {
            return Err(IndexError::NotFound(path.to_path_buf()));
        }
        let pool = connect(path, false).await?;

        let has_schema: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='index_meta'",
        )
        .fetch_one(&pool)
        .await?;
        if !has_schema {
            pool.close().await;
            return Err(IndexError::NotFound(path.to_path_buf()));
        }

        let stored_dims: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'dims'")
                .fetch_optional(&pool)
                .await?;
        if let Some(dims) = stored_dims.and_then(|d| d.parse::<usize>().ok()) {
            if dims != embedder.dims() {
                pool.close().await;
                return Err(IndexError::DimensionMismatch {
                    expected: dims,
                    actual: embedder.dims(),
                });
            }
        }

        Ok(Self::from_parts(path, pool, embedder, options))
    }

    fn from_parts(
        path: &Path,
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
        options: IndexOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.to_path_buf(),
                pool,
                embedder,
                options,
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.inner.embedder.clone()
    }

    pub fn options(&self) -> IndexOptions {
        self.inner.options
    }

    /// Replace every entry with the chunks of `documents`.
    pub async fn rebuild(&self, documents: &[Document]) -> Result<IndexStats, IndexError> {
        let pending: Vec<PendingChunk> = documents
            .iter()
            .flat_map(|doc| self.chunk(doc))
            .collect();
        let vectors = self.embed(&pending).await?;

        let _guard = self.inner.write_lock.lock().await;
        let mut tx = self.inner.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        write_meta(&mut tx, self.inner.embedder.as_ref()).await?;
        for (p, vector) in pending.iter().zip(vectors.iter()) {
            insert_chunk(&mut tx, &p.chunk, &p.hash, vector).await?;
        }
        tx.commit().await?;

        info!(
            documents = documents.len(),
            chunks = pending.len(),
            "index rebuilt"
        );
        Ok(IndexStats {
            documents: documents.len(),
            chunks_added: pending.len(),
            chunks_skipped: 0,
        })
    }

    /// Append `documents` to the index.
    ///
    /// Only chunks not already present (same source path and content hash)
    /// are embedded; existing entries are never re-embedded or rewritten.
    /// New chunks of a source that is already indexed continue its chunk
    /// numbering. All inserts land in one transaction.
    #[instrument(skip_all, fields(documents = documents.len()))]
    pub async fn add(&self, documents: &[Document]) -> Result<IndexStats, IndexError> {
        let _guard = self.inner.write_lock.lock().await;

        let mut existing: HashMap<String, (HashSet<String>, i64)> = HashMap::new();
        for doc in documents {
            if existing.contains_key(&doc.source_path) {
                continue;
            }
            let rows = sqlx::query("SELECT hash, chunk_index FROM chunks WHERE source_path = ?")
                .bind(&doc.source_path)
                .fetch_all(&self.inner.pool)
                .await?;
            let mut hashes = HashSet::new();
            let mut next_index = 0i64;
            for row in rows {
                hashes.insert(row.get::<String, _>("hash"));
                next_index = next_index.max(row.get::<i64, _>("chunk_index") + 1);
            }
            existing.insert(doc.source_path.clone(), (hashes, next_index));
        }

        let mut pending = Vec::new();
        let mut skipped = 0usize;
        for doc in documents {
            let Some((hashes, next_index)) = existing.get_mut(&doc.source_path) else {
                continue;
            };
            for mut p in self.chunk(doc) {
                if !hashes.insert(p.hash.clone()) {
                    skipped += 1;
                    continue;
                }
                p.chunk.chunk_index = *next_index;
                *next_index += 1;
                pending.push(p);
            }
        }

        if pending.is_empty() {
            debug!(skipped, "nothing new to index");
            return Ok(IndexStats {
                documents: documents.len(),
                chunks_added: 0,
                chunks_skipped: skipped,
            });
        }

        let vectors = self.embed(&pending).await?;

        let mut tx = self.inner.pool.begin().await?;
        write_meta(&mut tx, self.inner.embedder.as_ref()).await?;
        for (p, vector) in pending.iter().zip(vectors.iter()) {
            insert_chunk(&mut tx, &p.chunk, &p.hash, vector).await?;
        }
        tx.commit().await?;

        info!(added = pending.len(), skipped, "index extended");
        Ok(IndexStats {
            documents: documents.len(),
            chunks_added: pending.len(),
            chunks_skipped: skipped,
        })
    }

    /// Drop every chunk of `source_path`. Returns the number removed.
    pub async fn remove(&self, source_path: &str) -> Result<u64, IndexError> {
        let _guard = self.inner.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM chunks WHERE source_path = ?")
            .bind(source_path)
            .execute(&self.inner.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Return up to `k` chunks ranked by cosine similarity to `text`.
    ///
    /// An empty index yields an empty result without calling the embedder.
    pub async fn query(&self, text: &str, k: usize) -> Result<RetrievalResult, IndexError> {
        if k == 0 || self.count().await? == 0 {
            return Ok(RetrievalResult::default());
        }

        let query_vec = embed_query(self.inner.embedder.as_ref(), text)
            .await
            .map_err(|e| IndexError::Embedding(format!("{:#}", e)))?;

        let rows = sqlx::query("SELECT source_path, chunk_index, content, embedding FROM chunks")
            .fetch_all(&self.inner.pool)
            .await?;

        let mut hits: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(&query_vec, &blob_to_vec(&blob)) as f64;
                ScoredChunk {
                    chunk: DocumentChunk {
                        content: row.get("content"),
                        source_path: row.get("source_path"),
                        chunk_index: row.get("chunk_index"),
                    },
                    score,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(RetrievalResult::new(hits))
    }

    pub async fn count(&self) -> Result<i64, IndexError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.inner.pool)
            .await?)
    }

    /// Distinct source paths currently indexed, sorted.
    pub async fn sources(&self) -> Result<Vec<String>, IndexError> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT source_path FROM chunks ORDER BY source_path")
                .fetch_all(&self.inner.pool)
                .await?,
        )
    }

    fn chunk(&self, doc: &Document) -> Vec<PendingChunk> {
        chunk_document(doc, self.inner.options.max_chars, self.inner.options.overlap_chars)
            .into_iter()
            .map(|chunk| PendingChunk {
                hash: content_hash(&chunk.content),
                chunk,
            })
            .collect()
    }

    async fn embed(&self, pending: &[PendingChunk]) -> Result<Vec<Vec<f32>>, IndexError> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = pending.iter().map(|p| p.chunk.content.clone()).collect();
        let vectors = embed_batched(
            self.inner.embedder.as_ref(),
            &texts,
            self.inner.options.batch_size,
        )
        .await
        .map_err(|e| IndexError::Embedding(format!("{:#}", e)))?;

        let dims = self.inner.embedder.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(IndexError::DimensionMismatch {
                expected: dims,
                actual: bad.len(),
            });
        }
        Ok(vectors)
    }
}

async fn connect(path: &Path, create: bool) -> Result<SqlitePool, IndexError> {
    if create {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| IndexError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal);

    Ok(SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?)
}

async fn migrate(pool: &SqlitePool) -> Result<(), IndexError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            source_path TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(source_path, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source_path ON chunks(source_path)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn write_meta(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    embedder: &dyn Embedder,
) -> Result<(), IndexError> {
    for (key, value) in [
        ("model", embedder.model_name().to_string()),
        ("dims", embedder.dims().to_string()),
    ] {
        sqlx::query("INSERT OR REPLACE INTO index_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn insert_chunk(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chunk: &DocumentChunk,
    hash: &str,
    vector: &[f32],
) -> Result<(), IndexError> {
    sqlx::query(
        "INSERT INTO chunks (id, source_path, chunk_index, content, hash, embedding, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&chunk.source_path)
    .bind(chunk.chunk_index)
    .bind(&chunk.content)
    .bind(hash)
    .bind(vec_to_blob(vector))
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn content_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(text.as_bytes()))
}
