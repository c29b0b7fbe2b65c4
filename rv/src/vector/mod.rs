//! Vector backend boundary
//!
//! The index itself is pluggable; the runtime only needs batch upserts
//! and top-k search. `embed_batch` tags every record with
//! `metadata.column_name` so multiple embedded columns of the same
//! table stay disambiguated at query time. Embedding computation is an
//! external concern behind [`Embedder`]; tests use a deterministic
//! hashing embedder.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use eyre::{Result, eyre};
use serde_json::Value;
use tracing::{debug, info};

/// One stored vector record
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

/// A scored search hit, serialized as a JSON row for `read_json_auto`
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub metadata: Value,
}

/// Computes embeddings for texts
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// The pluggable vector index
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Insert or replace records by id
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// Top-k by similarity, optionally filtered on a metadata field
    async fn search(&self, embedding: &[f32], k: usize, metadata_filter: Option<(&str, &str)>) -> Result<Vec<SearchHit>>;
}

/// Write `(id, text, embedding, metadata)` records for one table column
///
/// `rows` must be objects projecting `id`, `text`, and optional
/// `metadata`. Batches of `batch_size` go to the embedder together.
pub async fn embed_batch(
    backend: &dyn VectorBackend,
    embedder: &dyn Embedder,
    table: &str,
    column: &str,
    rows: &[Value],
    batch_size: usize,
) -> Result<usize> {
    debug!(table, column, rows = rows.len(), "embed_batch: called");
    let batch_size = batch_size.max(1);
    let mut written = 0;

    for chunk in rows.chunks(batch_size) {
        let mut ids = Vec::with_capacity(chunk.len());
        let mut texts = Vec::with_capacity(chunk.len());
        let mut metas = Vec::with_capacity(chunk.len());
        for row in chunk {
            let id = row
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| eyre!("embed_batch row missing id"))?;
            let text = row
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| eyre!("embed_batch row missing text"))?;
            ids.push(id.to_string());
            texts.push(text.to_string());
            metas.push(row.get("metadata").cloned().unwrap_or(Value::Null));
        }

        let embeddings = embedder.embed(&texts).await?;
        let records = ids
            .into_iter()
            .zip(texts)
            .zip(embeddings)
            .zip(metas)
            .map(|(((id, text), embedding), meta)| {
                // column_name disambiguates multiple embedded columns
                let mut metadata = match meta {
                    Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                metadata.insert("table".into(), Value::String(table.to_string()));
                metadata.insert("column_name".into(), Value::String(column.to_string()));
                VectorRecord {
                    id,
                    text,
                    embedding,
                    metadata: Value::Object(metadata),
                }
            })
            .collect::<Vec<_>>();

        written += records.len();
        backend.upsert(records).await?;
    }

    info!(table, column, written, "embed_batch: complete");
    Ok(written)
}

/// Top-k search returning JSON rows, filtered to one embedded column
pub async fn vector_search_json(
    backend: &dyn VectorBackend,
    embedder: &dyn Embedder,
    query: &str,
    column: &str,
    k: usize,
    min_score: f32,
) -> Result<Vec<Value>> {
    let embedding = embedder
        .embed(&[query.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| eyre!("embedder returned no vector"))?;
    let hits = backend
        .search(&embedding, k, Some(("column_name", column)))
        .await?;
    Ok(hits
        .into_iter()
        .filter(|h| h.score >= min_score)
        .map(|h| serde_json::to_value(h).unwrap_or(Value::Null))
        .collect())
}

/// In-memory cosine-similarity backend (tests, small sessions)
#[derive(Default)]
pub struct InMemoryBackend {
    records: Mutex<HashMap<String, VectorRecord>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorBackend for InMemoryBackend {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut store = self.records.lock().unwrap_or_else(|p| p.into_inner());
        for record in records {
            // The same source id may be embedded under several columns
            let column = record
                .metadata
                .get("column_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let key = format!("{}:{}", column, record.id);
            store.insert(key, record);
        }
        Ok(())
    }

    async fn search(&self, embedding: &[f32], k: usize, metadata_filter: Option<(&str, &str)>) -> Result<Vec<SearchHit>> {
        let store = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let mut hits: Vec<SearchHit> = store
            .values()
            .filter(|r| match metadata_filter {
                Some((field, expected)) => r.metadata.get(field).and_then(|v| v.as_str()) == Some(expected),
                None => true,
            })
            .map(|r| SearchHit {
                id: r.id.clone(),
                text: r.text.clone(),
                score: cosine(embedding, &r.embedding),
                metadata: r.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub mod hashing {
    //! Deterministic test embedder: token hashing into a fixed-width vector

    use super::*;
    use std::hash::{Hash, Hasher};

    const WIDTH: usize = 64;

    /// Embeds by hashing whitespace tokens into buckets
    pub struct HashingEmbedder;

    #[async_trait]
    impl Embedder for HashingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut vector = vec![0.0f32; WIDTH];
                    for token in text.to_lowercase().split_whitespace() {
                        let mut hasher = std::collections::hash_map::DefaultHasher::new();
                        token.hash(&mut hasher);
                        vector[(hasher.finish() as usize) % WIDTH] += 1.0;
                    }
                    vector
                })
                .collect())
        }
    }
}
