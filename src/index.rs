//! In-memory vector index with durable SQLite snapshots.
//!
//! The index owns `(chunk, vector)` entries in insertion order and
//! answers nearest-neighbor queries by brute-force cosine similarity.
//! One index instance is bound to one embedding model: every vector must
//! have the dimensionality recorded at construction, and a query vector
//! of a different dimension is rejected rather than silently scored.
//!
//! Snapshots are ordinary SQLite files (`persist`/`load`), so a session's
//! index survives restarts without re-embedding its documents. Loading a
//! snapshot with missing or inconsistent dimension metadata fails fast.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{RetrievalHit, TextChunk};

#[derive(Debug, Clone)]
struct IndexEntry {
    chunk: TextChunk,
    vector: Vec<f32>,
}

/// Nearest-neighbor index over embedded chunks.
#[derive(Debug)]
pub struct VectorIndex {
    model: String,
    dims: usize,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// Create an empty index bound to an embedding model and dimension.
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
            entries: Vec::new(),
        }
    }

    /// Construct a fresh index from parallel chunk and vector lists.
    ///
    /// Fails with a data-integrity error when the lists differ in length
    /// or any vector does not match `dims`.
    pub fn build(
        model: impl Into<String>,
        dims: usize,
        chunks: Vec<TextChunk>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if chunks.len() != vectors.len() {
            bail!(
                "index build integrity error: {} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            );
        }
        let mut index = Self::new(model, dims);
        index.insert_batch(chunks, vectors)?;
        Ok(index)
    }

    /// Append chunk/vector pairs, preserving insertion order.
    pub fn insert_batch(&mut self, chunks: Vec<TextChunk>, vectors: Vec<Vec<f32>>) -> Result<()> {
        if chunks.len() != vectors.len() {
            bail!(
                "index insert integrity error: {} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            );
        }
        for (chunk, vector) in chunks.into_iter().zip(vectors.into_iter()) {
            if vector.len() != self.dims {
                bail!(
                    "index insert integrity error: vector of dimension {} in a {}-dimension index",
                    vector.len(),
                    self.dims
                );
            }
            self.entries.push(IndexEntry { chunk, vector });
        }
        Ok(())
    }

    /// Return the `k` most similar chunks by cosine similarity, in
    /// strictly non-increasing score order. Ties keep insertion order.
    /// `k` is clamped to the index size; an empty index yields an empty
    /// result, not an error. A query vector of the wrong dimension is an
    /// error: it belongs to a different embedding model.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<RetrievalHit>> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if vector.len() != self.dims {
            bail!(
                "query vector of dimension {} against a {}-dimension index",
                vector.len(),
                self.dims
            );
        }

        let mut hits: Vec<RetrievalHit> = self
            .entries
            .iter()
            .map(|entry| RetrievalHit {
                chunk: entry.chunk.clone(),
                score: cosine_similarity(vector, &entry.vector),
            })
            .collect();

        // Stable sort keeps insertion order among equal scores.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k.min(self.entries.len()));
        Ok(hits)
    }

    /// Discard all chunks and vectors.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Source names represented in the index, in first-seen order.
    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !names.iter().any(|n| n == &entry.chunk.source_name) {
                names.push(entry.chunk.source_name.clone());
            }
        }
        names
    }

    /// Write a snapshot of the whole index to a SQLite file, replacing
    /// any previous snapshot at that path.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool = connect(path, true).await?;
        create_snapshot_schema(&pool).await?;

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM index_vectors")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_chunks")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_meta").execute(&mut *tx).await?;

        sqlx::query("INSERT INTO index_meta (key, value) VALUES ('model', ?), ('dims', ?)")
            .bind(&self.model)
            .bind(self.dims.to_string())
            .execute(&mut *tx)
            .await?;

        for (position, entry) in self.entries.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO index_chunks (position, chunk_id, text, source_name, page_number, char_offset, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(position as i64)
            .bind(&entry.chunk.chunk_id)
            .bind(&entry.chunk.text)
            .bind(&entry.chunk.source_name)
            .bind(entry.chunk.page_number.map(|p| p as i64))
            .bind(entry.chunk.char_offset as i64)
            .bind(&entry.chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO index_vectors (chunk_id, embedding) VALUES (?, ?)")
                .bind(&entry.chunk.chunk_id)
                .bind(vec_to_blob(&entry.vector))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        pool.close().await;
        Ok(())
    }

    /// Load a snapshot written by [`persist`](Self::persist).
    ///
    /// Fails fast when the metadata is missing or malformed, or when any
    /// stored vector's decoded length disagrees with the recorded
    /// dimension; a mismatched snapshot must never answer queries.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("index snapshot not found: {}", path.display());
        }

        let pool = connect(path, false).await?;

        let model: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'model'")
                .fetch_optional(&pool)
                .await
                .context("index snapshot has no metadata table")?;
        let dims_raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'dims'")
                .fetch_optional(&pool)
                .await?;

        let model = model.ok_or_else(|| anyhow::anyhow!("index snapshot missing model metadata"))?;
        let dims: usize = dims_raw
            .ok_or_else(|| anyhow::anyhow!("index snapshot missing dims metadata"))?
            .parse()
            .context("index snapshot dims metadata is not a number")?;
        if dims == 0 {
            bail!("index snapshot records zero embedding dimensions");
        }

        let rows = sqlx::query(
            r#"
            SELECT c.chunk_id, c.text, c.source_name, c.page_number, c.char_offset, c.hash,
                   v.embedding
            FROM index_chunks c
            JOIN index_vectors v ON v.chunk_id = c.chunk_id
            ORDER BY c.position
            "#,
        )
        .fetch_all(&pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            if vector.len() != dims {
                pool.close().await;
                bail!(
                    "index snapshot corrupt: vector of dimension {} where {} was recorded",
                    vector.len(),
                    dims
                );
            }
            let page_number: Option<i64> = row.get("page_number");
            entries.push(IndexEntry {
                chunk: TextChunk {
                    chunk_id: row.get("chunk_id"),
                    text: row.get("text"),
                    source_name: row.get("source_name"),
                    page_number: page_number.map(|p| p as u32),
                    char_offset: row.get::<i64, _>("char_offset") as usize,
                    hash: row.get("hash"),
                },
                vector,
            });
        }

        pool.close().await;
        Ok(Self {
            model,
            dims,
            entries,
        })
    }
}

async fn connect(path: &Path, create: bool) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(create)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

async fn create_snapshot_schema(pool: &SqlitePool) -> Result<()> {
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

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_chunks (
            position INTEGER PRIMARY KEY,
            chunk_id TEXT NOT NULL UNIQUE,
            text TEXT NOT NULL,
            source_name TEXT NOT NULL,
            page_number INTEGER,
            char_offset INTEGER NOT NULL,
            hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_vectors (
            chunk_id TEXT NOT NULL PRIMARY KEY,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES index_chunks(chunk_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn chunk(text: &str) -> TextChunk {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        TextChunk {
            chunk_id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            source_name: "test.txt".to_string(),
            page_number: Some(1),
            char_offset: 0,
            hash: format!("{:x}", hasher.finalize()),
        }
    }

    fn small_index() -> VectorIndex {
        VectorIndex::build(
            "test-model",
            2,
            vec![chunk("north"), chunk("east"), chunk("northeast")],
            vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]],
        )
        .unwrap()
    }

    #[test]
    fn build_rejects_length_mismatch() {
        let err = VectorIndex::build("m", 2, vec![chunk("a")], vec![]).unwrap_err();
        assert!(err.to_string().contains("integrity"));
    }

    #[test]
    fn build_rejects_wrong_dimension_vector() {
        let err =
            VectorIndex::build("m", 2, vec![chunk("a")], vec![vec![1.0, 2.0, 3.0]]).unwrap_err();
        assert!(err.to_string().contains("dimension"));
    }

    #[test]
    fn query_orders_by_descending_similarity() {
        let index = small_index();
        let hits = index.query(&[0.0, 1.0], 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].chunk.text, "north");
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn query_clamps_k_to_index_size() {
        let index = small_index();
        let hits = index.query(&[1.0, 0.0], 50).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn query_on_empty_index_returns_empty() {
        let index = VectorIndex::new("m", 4);
        let hits = index.query(&[0.0; 4], 5).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn query_rejects_mismatched_dimension() {
        let index = small_index();
        assert!(index.query(&[1.0, 0.0, 0.0], 2).is_err());
    }

    #[test]
    fn ties_keep_insertion_order() {
        let index = VectorIndex::build(
            "m",
            2,
            vec![chunk("first"), chunk("second"), chunk("third")],
            vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![2.0, 0.0]],
        )
        .unwrap();
        // All three are parallel to the query: identical similarity.
        let hits = index.query(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits[0].chunk.text, "first");
        assert_eq!(hits[1].chunk.text, "second");
        assert_eq!(hits[2].chunk.text, "third");
    }

    #[test]
    fn reset_discards_entries() {
        let mut index = small_index();
        index.reset();
        assert!(index.is_empty());
        assert!(index.query(&[1.0, 0.0], 3).unwrap().is_empty());
    }

    #[test]
    fn source_names_in_first_seen_order() {
        let mut a = chunk("one");
        a.source_name = "a.pdf".to_string();
        let mut b = chunk("two");
        b.source_name = "b.pdf".to_string();
        let mut a2 = chunk("three");
        a2.source_name = "a.pdf".to_string();
        let index =
            VectorIndex::build("m", 1, vec![a, b, a2], vec![vec![1.0], vec![1.0], vec![1.0]])
                .unwrap();
        assert_eq!(index.source_names(), vec!["a.pdf", "b.pdf"]);
    }

    #[tokio::test]
    async fn persist_load_roundtrip_preserves_query_results() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");

        let index = small_index();
        index.persist(&path).await.unwrap();

        let loaded = VectorIndex::load(&path).await.unwrap();
        assert_eq!(loaded.model(), "test-model");
        assert_eq!(loaded.dims(), 2);
        assert_eq!(loaded.len(), index.len());

        let query = [0.3f32, 0.9];
        let before = index.query(&query, 3).unwrap();
        let after = loaded.query(&query, 3).unwrap();
        assert_eq!(before.len(), after.len());
        for (x, y) in before.iter().zip(after.iter()) {
            assert_eq!(x.chunk.text, y.chunk.text);
            assert!((x.score - y.score).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn load_missing_snapshot_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("absent.sqlite");
        assert!(VectorIndex::load(&path).await.is_err());
    }

    #[tokio::test]
    async fn load_rejects_corrupt_dimension_metadata() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");

        let index = small_index();
        index.persist(&path).await.unwrap();

        // Rewrite dims so the stored vectors no longer match.
        let pool = connect(&path, false).await.unwrap();
        sqlx::query("UPDATE index_meta SET value = '7' WHERE key = 'dims'")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        assert!(VectorIndex::load(&path).await.is_err());
    }

    #[tokio::test]
    async fn persist_overwrites_previous_snapshot() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");

        let index = small_index();
        index.persist(&path).await.unwrap();

        let smaller = VectorIndex::build("m2", 2, vec![chunk("only")], vec![vec![0.5, 0.5]])
            .unwrap();
        smaller.persist(&path).await.unwrap();

        let loaded = VectorIndex::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.model(), "m2");
    }
}
