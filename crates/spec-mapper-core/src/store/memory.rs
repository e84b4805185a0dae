//! In-memory [`VectorIndex`] for tests and offline runs.
//!
//! Collections live in a `HashMap` behind `std::sync::RwLock`. Search is
//! brute-force cosine similarity over every point in the collection.
//! Publishing and replacing hold the write lock for the whole batch, which
//! makes them atomic with respect to concurrent searches.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::cosine_similarity;
use crate::error::{MapError, Result};
use crate::models::{CollectionInfo, IndexPoint};

use super::{
    check_compatible, check_dims, check_same_content, rank_hits, CollectionMeta, IndexHit,
    SearchFilter, VectorIndex,
};

struct StoredCollection {
    info: CollectionInfo,
    /// Keyed by chunk id.
    points: BTreeMap<String, IndexPoint>,
}

impl StoredCollection {
    fn new(meta: &CollectionMeta, points: &[IndexPoint]) -> Self {
        let points: BTreeMap<String, IndexPoint> = points
            .iter()
            .map(|p| (p.chunk.id.clone(), p.clone()))
            .collect();
        Self {
            info: CollectionInfo {
                name: meta.name.clone(),
                source: meta.source.clone(),
                ingested_at: Utc::now(),
                chunk_count: points.len(),
                model: meta.model.clone(),
                dims: meta.dims,
            },
            points,
        }
    }
}

#[derive(Default)]
pub struct InMemoryIndex {
    collections: RwLock<HashMap<String, StoredCollection>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> MapError {
    MapError::Storage("in-memory index lock poisoned".to_string())
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, meta: &CollectionMeta, points: &[IndexPoint]) -> Result<usize> {
        check_dims(meta, points)?;

        let mut collections = self.collections.write().map_err(|_| poisoned())?;
        if let Some(stored) = collections.get(&meta.name) {
            check_compatible(&stored.info, meta)?;
            check_same_content(&meta.name, stored.points.keys().map(String::as_str), points)?;
            return Ok(0);
        }
        let stored = StoredCollection::new(meta, points);
        let created = stored.points.len();
        collections.insert(meta.name.clone(), stored);
        Ok(created)
    }

    async fn replace(&self, meta: &CollectionMeta, points: &[IndexPoint]) -> Result<usize> {
        check_dims(meta, points)?;

        let mut collections = self.collections.write().map_err(|_| poisoned())?;
        let stored = StoredCollection::new(meta, points);
        let written = stored.points.len();
        collections.insert(meta.name.clone(), stored);
        Ok(written)
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<IndexHit>> {
        let collections = self.collections.read().map_err(|_| poisoned())?;
        let stored = collections
            .get(collection)
            .ok_or_else(|| MapError::CollectionNotFound(collection.to_string()))?;

        let mut hits: Vec<IndexHit> = stored
            .points
            .values()
            .filter(|p| filter.matches(&p.chunk))
            .map(|p| IndexHit {
                score: cosine_similarity(vector, &p.vector) as f64,
                chunk: p.chunk.clone(),
            })
            .collect();
        rank_hits(&mut hits, k);
        Ok(hits)
    }

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let collections = self.collections.read().map_err(|_| poisoned())?;
        Ok(collections.get(name).map(|c| c.info.clone()))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let collections = self.collections.read().map_err(|_| poisoned())?;
        let mut infos: Vec<CollectionInfo> = collections.values().map(|c| c.info.clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        let mut collections = self.collections.write().map_err(|_| poisoned())?;
        Ok(collections.remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkKind};

    fn meta(name: &str) -> CollectionMeta {
        CollectionMeta {
            name: name.to_string(),
            source: "spec.json".to_string(),
            model: "test".to_string(),
            dims: 2,
        }
    }

    fn point(id: &str, kind: ChunkKind, vector: [f32; 2]) -> IndexPoint {
        IndexPoint {
            chunk: Chunk {
                id: id.to_string(),
                kind,
                structural_path: format!("Schema.{}", id),
                text: id.to_string(),
                parent_id: None,
                method: None,
                targets: Vec::new(),
            },
            vector: vector.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let index = InMemoryIndex::new();
        let points = vec![
            point("a", ChunkKind::SchemaSummary, [1.0, 0.0]),
            point("b", ChunkKind::SchemaProperties, [0.0, 1.0]),
        ];
        assert_eq!(index.upsert(&meta("hr"), &points).await.unwrap(), 2);
        assert_eq!(index.upsert(&meta("hr"), &points).await.unwrap(), 0);
        let info = index.collection("hr").await.unwrap().unwrap();
        assert_eq!(info.chunk_count, 2);
    }

    #[tokio::test]
    async fn test_search_ranks_and_filters() {
        let index = InMemoryIndex::new();
        let points = vec![
            point("a", ChunkKind::SchemaSummary, [1.0, 0.0]),
            point("b", ChunkKind::SchemaProperties, [0.8, 0.6]),
            point("c", ChunkKind::SchemaProperties, [0.0, 1.0]),
        ];
        index.upsert(&meta("hr"), &points).await.unwrap();

        let hits = index
            .search("hr", &[1.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let filter = SearchFilter {
            kinds: vec![ChunkKind::SchemaProperties],
            path_contains: None,
        };
        let hits = index.search("hr", &[1.0, 0.0], 1, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "b");
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let index = InMemoryIndex::new();
        let err = index
            .search("nope", &[1.0, 0.0], 5, &SearchFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::CollectionNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected_without_partial_write() {
        let index = InMemoryIndex::new();
        let mut bad = point("x", ChunkKind::Endpoint, [1.0, 0.0]);
        bad.vector.push(0.5);
        let points = vec![point("ok", ChunkKind::Endpoint, [1.0, 0.0]), bad];
        let err = index.upsert(&meta("hr"), &points).await.unwrap_err();
        assert!(matches!(err, MapError::InvalidRequest(_)));
        assert!(index.collection("hr").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_model_mismatch_rejected() {
        let index = InMemoryIndex::new();
        index
            .upsert(&meta("hr"), &[point("a", ChunkKind::Endpoint, [1.0, 0.0])])
            .await
            .unwrap();
        let mut other = meta("hr");
        other.model = "other".to_string();
        let err = index
            .upsert(&other, &[point("b", ChunkKind::Endpoint, [1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_upsert_rejects_different_content() {
        let index = InMemoryIndex::new();
        let v1 = [point("employeeId", ChunkKind::SchemaProperties, [1.0, 0.0])];
        index.upsert(&meta("hr"), &v1).await.unwrap();

        let v2 = [point("staffNumber", ChunkKind::SchemaProperties, [1.0, 0.0])];
        let err = index.upsert(&meta("hr"), &v2).await.unwrap_err();
        assert!(matches!(err, MapError::InvalidRequest(ref m) if m.contains("different content")));

        let hits = index
            .search("hr", &[1.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["employeeId"]);
    }

    #[tokio::test]
    async fn test_replace_swaps_content() {
        let index = InMemoryIndex::new();
        index
            .upsert(&meta("hr"), &[point("old", ChunkKind::Endpoint, [1.0, 0.0])])
            .await
            .unwrap();
        let fresh = [
            point("new-a", ChunkKind::Endpoint, [1.0, 0.0]),
            point("new-b", ChunkKind::Endpoint, [0.0, 1.0]),
        ];
        assert_eq!(index.replace(&meta("hr"), &fresh).await.unwrap(), 2);

        let hits = index
            .search("hr", &[1.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["new-a", "new-b"]);
        assert_eq!(index.collection("hr").await.unwrap().unwrap().chunk_count, 2);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let index = InMemoryIndex::new();
        let p = [point("a", ChunkKind::Endpoint, [1.0, 0.0])];
        index.upsert(&meta("b-col"), &p).await.unwrap();
        index.upsert(&meta("a-col"), &p).await.unwrap();
        let names: Vec<String> = index
            .list_collections()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a-col", "b-col"]);
        assert!(index.delete_collection("a-col").await.unwrap());
        assert!(!index.delete_collection("a-col").await.unwrap());
    }
}
