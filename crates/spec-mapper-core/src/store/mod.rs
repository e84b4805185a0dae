//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only storage seam in the core: named
//! collections of embedded [`Chunk`]s with nearest-neighbour search and
//! metadata filtering. Backends: [`memory::InMemoryIndex`] here, and the
//! SQLite index in the `spec-mapper` app crate.
//!
//! Implementations must be `Send + Sync` and must publish an
//! [`upsert`](VectorIndex::upsert) or [`replace`](VectorIndex::replace)
//! atomically: a concurrent [`search`](VectorIndex::search) sees either
//! none or all of the batch. A published collection never changes
//! content in place; it is only ever swapped whole or dropped.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::{MapError, Result};
use crate::models::{Chunk, ChunkKind, CollectionInfo, IndexPoint};

/// Identity of a collection being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMeta {
    pub name: String,
    pub source: String,
    pub model: String,
    pub dims: usize,
}

/// Metadata filter applied inside the index before ranking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    /// Allowed chunk kinds; empty means all.
    pub kinds: Vec<ChunkKind>,
    /// Case-insensitive substring of `structural_path`.
    pub path_contains: Option<String>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty() && self.path_contains.is_none()
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&chunk.kind) {
            return false;
        }
        match &self.path_contains {
            Some(needle) => chunk
                .structural_path
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// A raw nearest-neighbour hit.
#[derive(Debug, Clone)]
pub struct IndexHit {
    /// Cosine similarity between the query vector and the chunk vector.
    pub score: f64,
    pub chunk: Chunk,
}

/// Named-collection vector store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Publish a new collection; no-op for identical content |
/// | [`replace`](VectorIndex::replace) | Atomically swap a collection's content |
/// | [`search`](VectorIndex::search) | Top-k cosine search with a metadata filter |
/// | [`collection`](VectorIndex::collection) | Metadata for one collection |
/// | [`list_collections`](VectorIndex::list_collections) | All collections, by name |
/// | [`delete_collection`](VectorIndex::delete_collection) | Drop a collection and its chunks |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Publish points as a collection, creating it on first use.
    ///
    /// Returns the number of newly created points. Publishing the same
    /// chunk ids into an existing collection creates nothing and returns
    /// 0. Fails with
    /// [`MapError::InvalidRequest`](crate::error::MapError::InvalidRequest)
    /// when the collection exists with a different model, dimensionality
    /// or chunk-id set.
    async fn upsert(&self, meta: &CollectionMeta, points: &[IndexPoint]) -> Result<usize>;

    /// Drop any existing content of the collection and publish `points` in
    /// its place, in one atomic step. Returns the number of points written.
    async fn replace(&self, meta: &CollectionMeta, points: &[IndexPoint]) -> Result<usize>;

    /// Return up to `k` hits ordered by score descending, then chunk id.
    ///
    /// Fails with [`MapError::CollectionNotFound`](crate::error::MapError::CollectionNotFound)
    /// when the collection does not exist.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<IndexHit>>;

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>>;

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>>;

    /// Returns `true` when a collection was removed.
    async fn delete_collection(&self, name: &str) -> Result<bool>;
}

/// Check that an existing collection can accept points from `meta`.
pub fn check_compatible(existing: &CollectionInfo, meta: &CollectionMeta) -> Result<()> {
    if existing.model != meta.model || existing.dims != meta.dims {
        return Err(MapError::InvalidRequest(format!(
            "collection '{}' was built with {} ({} dims); refusing to add {} ({} dims) vectors",
            existing.name, existing.model, existing.dims, meta.model, meta.dims
        )));
    }
    Ok(())
}

/// Check that re-publishing into an existing collection carries exactly the
/// chunk ids it already holds.
pub fn check_same_content<'a>(
    name: &str,
    existing: impl IntoIterator<Item = &'a str>,
    points: &[IndexPoint],
) -> Result<()> {
    let existing: HashSet<&str> = existing.into_iter().collect();
    let incoming: HashSet<&str> = points.iter().map(|p| p.chunk.id.as_str()).collect();
    if existing != incoming {
        return Err(MapError::InvalidRequest(format!(
            "collection '{}' exists with different content; ingest under a fresh name or drop it",
            name
        )));
    }
    Ok(())
}

/// Reject points whose vectors do not match the collection's dimensionality.
pub fn check_dims(meta: &CollectionMeta, points: &[IndexPoint]) -> Result<()> {
    for point in points {
        if point.vector.len() != meta.dims {
            return Err(MapError::InvalidRequest(format!(
                "chunk {} has {} dims, collection '{}' expects {}",
                point.chunk.id,
                point.vector.len(),
                meta.name,
                meta.dims
            )));
        }
    }
    Ok(())
}

/// Sort hits by score descending, ties by chunk id, and keep `k`.
pub fn rank_hits(hits: &mut Vec<IndexHit>, k: usize) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    hits.truncate(k);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(kind: ChunkKind, path: &str) -> Chunk {
        Chunk {
            id: path.to_string(),
            kind,
            structural_path: path.to_string(),
            text: String::new(),
            parent_id: None,
            method: None,
            targets: Vec::new(),
        }
    }

    #[test]
    fn test_filter_by_kind_and_path() {
        let filter = SearchFilter {
            kinds: vec![ChunkKind::Endpoint],
            path_contains: Some("absence".into()),
        };
        assert!(filter.matches(&chunk(ChunkKind::Endpoint, "POST /Absences")));
        assert!(!filter.matches(&chunk(ChunkKind::Parameter, "POST /absences#id")));
        assert!(!filter.matches(&chunk(ChunkKind::Endpoint, "GET /employees")));
        assert!(SearchFilter::default().matches(&chunk(ChunkKind::Parameter, "x")));
    }

    #[test]
    fn test_same_content_compares_id_sets() {
        let points = vec![
            IndexPoint { chunk: chunk(ChunkKind::Endpoint, "a"), vector: vec![1.0] },
            IndexPoint { chunk: chunk(ChunkKind::Endpoint, "b"), vector: vec![1.0] },
        ];
        assert!(check_same_content("hr", ["b", "a"], &points).is_ok());
        let err = check_same_content("hr", ["a", "c"], &points).unwrap_err();
        assert!(err.to_string().contains("different content"));
        assert!(check_same_content("hr", ["a"], &points).is_err());
    }

    #[test]
    fn test_rank_hits_orders_and_truncates() {
        let mut hits = vec![
            IndexHit { score: 0.5, chunk: chunk(ChunkKind::Endpoint, "b") },
            IndexHit { score: 0.9, chunk: chunk(ChunkKind::Endpoint, "c") },
            IndexHit { score: 0.5, chunk: chunk(ChunkKind::Endpoint, "a") },
        ];
        rank_hits(&mut hits, 2);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }
}
