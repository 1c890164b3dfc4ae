// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Event and profile vector collections.
//!
//! Two sqlite tables hold `(id, document, metadata, embedding)` rows; cosine
//! similarity runs in-process over candidate rows.  Metadata filters follow
//! the store's query dialect: flat equality, `$and` composition, and
//! `$gte`/`$lte` ranges (used for `timestamp_epoch`).
//!
//! Embeddings come from a pluggable [`Embedder`]: the HTTP implementation
//! talks to the configured embedding model; the hashing implementation is
//! deterministic and offline (tests, degraded mode).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use corvid_config::ModelEndpoint;

use crate::MemoryError;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError>;
}

/// Deterministic character-trigram hashing embedder.  No network, stable
/// across runs; near-duplicate texts land near each other.
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0f32; self.dim];
                let chars: Vec<char> = text.chars().collect();
                for window in chars.windows(3.min(chars.len().max(1))) {
                    let mut hasher = DefaultHasher::new();
                    window.hash(&mut hasher);
                    let bucket = (hasher.finish() as usize) % self.dim;
                    v[bucket] += 1.0;
                }
                normalize(&mut v);
                v
            })
            .collect())
    }
}

/// OpenAI-style `/embeddings` client over the configured embedding model.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: ModelEndpoint,
}

impl HttpEmbedder {
    pub fn new(client: reqwest::Client, endpoint: ModelEndpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        let url = format!(
            "{}/embeddings",
            self.endpoint.api_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.endpoint.model_name,
            "input": texts,
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.endpoint.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::Embedding(format!("status={status} body={body}")));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        let data = value["data"]
            .as_array()
            .ok_or_else(|| MemoryError::Embedding("missing data".into()))?;
        data.iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|nums| {
                        nums.iter()
                            .filter_map(|n| n.as_f64())
                            .map(|f| f as f32)
                            .collect()
                    })
                    .ok_or_else(|| MemoryError::Embedding("missing embedding".into()))
            })
            .collect()
    }
}

fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// One query hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub document: String,
    pub metadata: serde_json::Value,
    /// Cosine distance (0 = identical direction).
    pub distance: f32,
}

pub struct VectorStore {
    conn: Mutex<Connection>,
    embedder: Arc<dyn Embedder>,
}

const COLLECTIONS: [&str; 2] = ["events", "profiles"];

impl VectorStore {
    pub fn open(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoryError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            embedder,
        };
        store.init_schema()?;
        info!(path = %path.display(), "vector store opened");
        Ok(store)
    }

    pub fn open_in_memory(embedder: Arc<dyn Embedder>) -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            embedder,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), MemoryError> {
        let conn = self.lock_conn();
        for table in COLLECTIONS {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        id TEXT PRIMARY KEY,
                        document TEXT NOT NULL,
                        metadata TEXT NOT NULL,
                        embedding BLOB NOT NULL
                    )"
                ),
                [],
            )?;
        }
        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub async fn upsert_event(
        &self,
        event_id: &str,
        document: &str,
        metadata: serde_json::Value,
    ) -> Result<(), MemoryError> {
        self.upsert("events", event_id, document, metadata).await
    }

    pub async fn upsert_profile(
        &self,
        profile_id: &str,
        document: &str,
        metadata: serde_json::Value,
    ) -> Result<(), MemoryError> {
        self.upsert("profiles", profile_id, document, metadata).await
    }

    async fn upsert(
        &self,
        table: &str,
        id: &str,
        document: &str,
        metadata: serde_json::Value,
    ) -> Result<(), MemoryError> {
        let embedding = self
            .embedder
            .embed(std::slice::from_ref(&document.to_string()))
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        let blob = embedding_to_blob(&embedding);
        let meta_text = serde_json::to_string(&metadata)?;
        let conn = self.lock_conn();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {table} (id, document, metadata, embedding)
                 VALUES (?1, ?2, ?3, ?4)"
            ),
            params![id, document, meta_text, blob],
        )?;
        debug!(table, id, doc_len = document.len(), "vector upsert");
        Ok(())
    }

    pub async fn query_events(
        &self,
        query: &str,
        top_k: usize,
        where_filter: Option<&serde_json::Value>,
    ) -> Result<Vec<VectorHit>, MemoryError> {
        self.query("events", query, top_k, where_filter).await
    }

    pub async fn query_profiles(
        &self,
        query: &str,
        top_k: usize,
        where_filter: Option<&serde_json::Value>,
    ) -> Result<Vec<VectorHit>, MemoryError> {
        self.query("profiles", query, top_k, where_filter).await
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<VectorHit>, MemoryError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT id, document, metadata FROM events WHERE id = ?1")?;
        let mut rows = stmt.query(params![event_id])?;
        match rows.next()? {
            Some(row) => {
                let metadata: String = row.get(2)?;
                Ok(Some(VectorHit {
                    id: row.get(0)?,
                    document: row.get(1)?,
                    metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                    distance: 0.0,
                }))
            }
            None => Ok(None),
        }
    }

    async fn query(
        &self,
        table: &str,
        query: &str,
        top_k: usize,
        where_filter: Option<&serde_json::Value>,
    ) -> Result<Vec<VectorHit>, MemoryError> {
        let query_embedding = self
            .embedder
            .embed(std::slice::from_ref(&query.to_string()))
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let rows: Vec<(String, String, String, Vec<u8>)> = {
            let conn = self.lock_conn();
            let mut stmt =
                conn.prepare(&format!("SELECT id, document, metadata, embedding FROM {table}"))?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };

        let mut hits: Vec<VectorHit> = rows
            .into_iter()
            .filter_map(|(id, document, meta_text, blob)| {
                let metadata: serde_json::Value = serde_json::from_str(&meta_text).ok()?;
                if let Some(filter) = where_filter {
                    if !matches_where(&metadata, filter) {
                        return None;
                    }
                }
                let embedding = blob_to_embedding(&blob);
                let distance = cosine_distance(&query_embedding, &embedding);
                Some(VectorHit {
                    id,
                    document,
                    metadata,
                    distance,
                })
            })
            .collect();

        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot / (na * nb)
}

/// Metadata filter: flat equality, `$and` lists, `$gte`/`$lte` ranges.
fn matches_where(metadata: &serde_json::Value, filter: &serde_json::Value) -> bool {
    let Some(obj) = filter.as_object() else {
        return true;
    };
    obj.iter().all(|(key, expected)| {
        if key == "$and" {
            return expected
                .as_array()
                .map(|clauses| clauses.iter().all(|c| matches_where(metadata, c)))
                .unwrap_or(false);
        }
        let actual = &metadata[key];
        match expected {
            serde_json::Value::Object(range) => range.iter().all(|(op, bound)| {
                let (Some(a), Some(b)) = (actual.as_f64(), bound.as_f64()) else {
                    return false;
                };
                match op.as_str() {
                    "$gte" => a >= b,
                    "$lte" => a <= b,
                    "$gt" => a > b,
                    "$lt" => a < b,
                    _ => false,
                }
            }),
            _ => actual == expected,
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
