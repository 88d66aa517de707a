//! Dense retrieval leg: query embedding plus pgvector cosine search.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use pgvector::Vector;
use tokio::sync::Mutex;
use tokio_postgres::types::Json as PgJson;
use tokio_postgres::Client;
use tracing::debug;

use crate::embedder::OpenAiEmbedder;
use crate::error::{RagError, RagResult};
use crate::records::ChunkMetadata;

/// Equality filters applied to chunk payload metadata.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Document name, e.g. `SOLAS`.
    pub document: Option<String>,
    /// Document family, e.g. `convention`.
    pub collection: Option<String>,
    /// Origin corpus, e.g. `imo_rules`.
    pub source_type: Option<String>,
    /// Fragment granularity, e.g. `table_cell`.
    pub chunk_type: Option<String>,
}

/// One dense hit, ordered by descending cosine similarity.
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// Chunk identifier.
    pub chunk_id: String,
    /// Raw chunk text.
    pub text: String,
    /// Cosine similarity in [-1, 1].
    pub score: f64,
    /// Payload metadata.
    pub metadata: ChunkMetadata,
}

/// Client for top-k nearest-neighbour search over the chunk table.
#[derive(Clone)]
pub struct VectorIndex {
    db: Arc<Client>,
    embedder: Arc<OpenAiEmbedder>,
    cache: Option<Arc<Mutex<LruCache<String, Vec<f32>>>>>,
}

const SEARCH_SQL: &str = "SELECT \
        chunk_id, \
        text, \
        metadata, \
        1 - (embedding <=> $1) AS score \
    FROM chunks \
    WHERE ($3::text IS NULL OR metadata->>'document' = $3) \
      AND ($4::text IS NULL OR metadata->>'collection' = $4) \
      AND ($5::text IS NULL OR metadata->>'source_type' = $5) \
      AND ($6::text IS NULL OR metadata->>'chunk_type' = $6) \
    ORDER BY embedding <=> $1 ASC \
    LIMIT $2";

impl VectorIndex {
    /// Builds a new vector index client.
    ///
    /// `cache_size` bounds the in-memory query-embedding cache; 0 disables it.
    pub fn new(db: Arc<Client>, embedder: Arc<OpenAiEmbedder>, cache_size: usize) -> Self {
        let cache =
            NonZeroUsize::new(cache_size).map(|cap| Arc::new(Mutex::new(LruCache::new(cap))));
        Self {
            db,
            embedder,
            cache,
        }
    }

    /// Embeds `query_text` and returns at most `top_k` chunks by cosine
    /// similarity, honouring the payload filters.
    pub async fn search(
        &self,
        query_text: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> RagResult<Vec<VectorHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embed_query(query_text.to_string()).await?;
        let vector = Vector::from(embedding);
        let limit = top_k as i64;
        let rows = self
            .db
            .query(
                SEARCH_SQL,
                &[
                    &vector,
                    &limit,
                    &filters.document,
                    &filters.collection,
                    &filters.source_type,
                    &filters.chunk_type,
                ],
            )
            .await
            .map_err(|err| RagError::IndexUnavailable {
                backend: "vector",
                reason: err.to_string(),
            })?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let PgJson(metadata): PgJson<ChunkMetadata> = row.get("metadata");
            out.push(VectorHit {
                chunk_id: row.get("chunk_id"),
                text: row.get("text"),
                score: row.get("score"),
                metadata,
            });
        }
        debug!(hits = out.len(), top_k, "dense leg complete");
        Ok(out)
    }

    /// Total chunks carrying an embedding; used by the admin stats endpoint.
    pub async fn point_count(&self) -> RagResult<i64> {
        let row = self
            .db
            .query_one("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL", &[])
            .await
            .map_err(|err| RagError::IndexUnavailable {
                backend: "vector",
                reason: err.to_string(),
            })?;
        Ok(row.get(0))
    }

    async fn embed_query(&self, query: String) -> RagResult<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = {
                let mut guard = cache.lock().await;
                guard.get(&query).cloned()
            } {
                return Ok(hit);
            }
        }

        let embedder = self.embedder.clone();
        let query_clone = query.clone();
        let embedding = tokio::task::spawn_blocking(move || embedder.embed_query(&query_clone))
            .await
            .map_err(|err| RagError::EmbeddingUnavailable(format!("join error: {err}")))?
            .map_err(|err| RagError::EmbeddingUnavailable(err.to_string()))?;

        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().await;
            guard.put(query, embedding.clone());
        }
        Ok(embedding)
    }
}
