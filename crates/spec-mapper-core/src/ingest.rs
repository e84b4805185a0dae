//! Ingestion: specification document → published collection.
//!
//! Pipeline: parse ([`SpecDocument::parse`]) → chunk
//! ([`chunk_document`]) → embed every chunk → one atomic
//! [`VectorIndex::upsert`] or [`VectorIndex::replace`].
//!
//! Ingestion is all-or-nothing. Parsing and embedding finish before the
//! index is touched, so a malformed document or an embedding outage
//! leaves the collection exactly as it was. Chunk ids are content
//! hashes, so re-ingesting an unchanged document creates nothing, while
//! a changed document is refused unless [`IngestMode::Replace`] is asked
//! for.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::chunk::chunk_document;
use crate::embedding::Embedder;
use crate::error::{MapError, Result};
use crate::models::IndexPoint;
use crate::openapi::SpecDocument;
use crate::retry::RetryPolicy;
use crate::store::{CollectionMeta, VectorIndex};

/// Number of chunk texts sent to the embedder per call.
pub const EMBED_BATCH_SIZE: usize = 64;

/// How to treat a collection that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IngestMode {
    /// Create the collection; identical content is a no-op, different
    /// content is refused.
    #[default]
    Publish,
    /// Swap the collection's content for the new document.
    Replace,
}

/// Outcome of one ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub collection: String,
    /// Chunks produced from the document.
    pub chunks_total: usize,
    /// Chunks that were not already present in the collection.
    pub chunks_created: usize,
    pub endpoints_extracted: usize,
    pub schemas_extracted: usize,
    pub warnings: Vec<String>,
}

/// Parse a raw document and ingest it.
pub async fn ingest_value(
    root: &Value,
    collection: &str,
    source: &str,
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    retry: &RetryPolicy,
    mode: IngestMode,
) -> Result<IngestReport> {
    let doc = SpecDocument::parse(root)?;
    ingest_document(&doc, collection, source, embedder, index, retry, mode).await
}

/// Chunk, embed and publish a parsed document under `collection`.
pub async fn ingest_document(
    doc: &SpecDocument,
    collection: &str,
    source: &str,
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    retry: &RetryPolicy,
    mode: IngestMode,
) -> Result<IngestReport> {
    if collection.trim().is_empty() {
        return Err(MapError::InvalidRequest(
            "collection name must not be empty".to_string(),
        ));
    }

    let mut warnings = doc.warnings.clone();
    let mut seen = HashSet::new();
    let mut chunks = Vec::new();
    for chunk in chunk_document(doc) {
        if seen.insert(chunk.id.clone()) {
            chunks.push(chunk);
        } else {
            warnings.push(format!(
                "duplicate chunk for {} skipped",
                chunk.structural_path
            ));
        }
    }

    let mut points = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(EMBED_BATCH_SIZE) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = retry
            .run("embed", || embedder.embed_batch(&texts))
            .await?
            .value;
        if vectors.len() != batch.len() {
            return Err(MapError::EmbeddingUnavailable(format!(
                "expected {} vectors, got {}",
                batch.len(),
                vectors.len()
            )));
        }
        for (chunk, vector) in batch.iter().zip(vectors) {
            points.push(IndexPoint {
                chunk: chunk.clone(),
                vector,
            });
        }
    }

    let meta = CollectionMeta {
        name: collection.to_string(),
        source: source.to_string(),
        model: embedder.model_name().to_string(),
        dims: embedder.dims(),
    };
    let created = match mode {
        IngestMode::Publish => retry.run("upsert", || index.upsert(&meta, &points)).await?,
        IngestMode::Replace => retry.run("replace", || index.replace(&meta, &points)).await?,
    }
    .value;

    for w in &warnings {
        warn!(collection, "{}", w);
    }
    info!(
        collection,
        chunks = points.len(),
        created,
        "collection published"
    );

    Ok(IngestReport {
        collection: collection.to_string(),
        chunks_total: points.len(),
        chunks_created: created,
        endpoints_extracted: doc.operations.len(),
        schemas_extracted: doc.schemas.len(),
        warnings,
    })
}
