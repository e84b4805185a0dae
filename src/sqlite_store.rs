//! SQLite-backed [`VectorIndex`] implementation.
//!
//! Collections and chunks live in the tables created by
//! [`migrate`](crate::migrate). Search loads the collection's vectors and
//! ranks them by cosine similarity in process, the same brute-force scan
//! the in-memory index performs. Publishing, replacing and dropping each
//! run in a single transaction.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::debug;

use spec_mapper_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use spec_mapper_core::error::{MapError, Result};
use spec_mapper_core::models::{Chunk, ChunkKind, CollectionInfo, IndexPoint, TargetField};
use spec_mapper_core::store::{
    check_compatible, check_dims, check_same_content, rank_hits, CollectionMeta, IndexHit,
    SearchFilter, VectorIndex,
};

/// SQLite implementation of the [`VectorIndex`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Connect to `[db].path` and make sure the schema exists.
pub async fn open(config: &crate::config::Config) -> anyhow::Result<Arc<SqliteIndex>> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteIndex::new(pool)))
}

/// Pool exhaustion and I/O are transient; everything else is a storage fault.
fn storage(e: sqlx::Error) -> MapError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            MapError::RetrievalUnavailable(e.to_string())
        }
        other => MapError::Storage(other.to_string()),
    }
}

fn row_to_info(row: &SqliteRow) -> CollectionInfo {
    let ingested_at: i64 = row.get("ingested_at");
    let dims: i64 = row.get("dims");
    let chunk_count: i64 = row.get("chunk_count");
    CollectionInfo {
        name: row.get("name"),
        source: row.get("source"),
        ingested_at: chrono::DateTime::from_timestamp(ingested_at, 0).unwrap_or_default(),
        chunk_count: chunk_count as usize,
        model: row.get("model"),
        dims: dims as usize,
    }
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let kind: String = row.get("kind");
    let kind: ChunkKind = kind.parse().map_err(MapError::Storage)?;
    let targets_json: String = row.get("targets_json");
    let targets: Vec<TargetField> = serde_json::from_str(&targets_json)?;
    Ok(Chunk {
        id: row.get("id"),
        kind,
        structural_path: row.get("structural_path"),
        text: row.get("text"),
        parent_id: row.get("parent_id"),
        method: row.get("method"),
        targets,
    })
}

const COLLECTION_SELECT: &str = r#"
    SELECT c.name, c.source, c.model, c.dims, c.ingested_at,
           (SELECT COUNT(*) FROM chunks k WHERE k.collection = c.name) AS chunk_count
    FROM collections c
"#;

async fn insert_collection(
    conn: &mut SqliteConnection,
    meta: &CollectionMeta,
    points: &[IndexPoint],
) -> Result<usize> {
    sqlx::query(
        "INSERT INTO collections (name, source, model, dims, ingested_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&meta.name)
    .bind(&meta.source)
    .bind(&meta.model)
    .bind(meta.dims as i64)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *conn)
    .await
    .map_err(storage)?;

    let mut created = 0usize;
    for point in points {
        let chunk = &point.chunk;
        let targets_json = serde_json::to_string(&chunk.targets)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO chunks (collection, id, kind, structural_path, text,
                                          parent_id, method, targets_json, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&meta.name)
        .bind(&chunk.id)
        .bind(chunk.kind.as_str())
        .bind(&chunk.structural_path)
        .bind(&chunk.text)
        .bind(&chunk.parent_id)
        .bind(&chunk.method)
        .bind(&targets_json)
        .bind(vec_to_blob(&point.vector))
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
        created += result.rows_affected() as usize;
    }
    Ok(created)
}

async fn remove_collection(conn: &mut SqliteConnection, name: &str) -> Result<u64> {
    sqlx::query("DELETE FROM chunks WHERE collection = ?")
        .bind(name)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
    let removed = sqlx::query("DELETE FROM collections WHERE name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await
        .map_err(storage)?
        .rows_affected();
    Ok(removed)
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, meta: &CollectionMeta, points: &[IndexPoint]) -> Result<usize> {
        check_dims(meta, points)?;

        let mut tx = self.pool.begin().await.map_err(storage)?;
        let existing = sqlx::query(&format!("{} WHERE c.name = ?", COLLECTION_SELECT))
            .bind(&meta.name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;

        if let Some(row) = existing {
            check_compatible(&row_to_info(&row), meta)?;
            let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE collection = ?")
                .bind(&meta.name)
                .fetch_all(&mut *tx)
                .await
                .map_err(storage)?;
            check_same_content(&meta.name, ids.iter().map(String::as_str), points)?;
            debug!(collection = %meta.name, "collection unchanged");
            return Ok(0);
        }

        let created = insert_collection(&mut tx, meta, points).await?;
        tx.commit().await.map_err(storage)?;
        debug!(collection = %meta.name, points = points.len(), created, "upsert committed");
        Ok(created)
    }

    async fn replace(&self, meta: &CollectionMeta, points: &[IndexPoint]) -> Result<usize> {
        check_dims(meta, points)?;

        let mut tx = self.pool.begin().await.map_err(storage)?;
        let removed = remove_collection(&mut tx, &meta.name).await?;
        let written = insert_collection(&mut tx, meta, points).await?;
        tx.commit().await.map_err(storage)?;
        debug!(collection = %meta.name, replaced = removed > 0, written, "replace committed");
        Ok(written)
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<IndexHit>> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
                .bind(collection)
                .fetch_one(&self.pool)
                .await
                .map_err(storage)?;
        if !exists {
            return Err(MapError::CollectionNotFound(collection.to_string()));
        }

        let rows = sqlx::query(
            r#"
            SELECT id, kind, structural_path, text, parent_id, method, targets_json, embedding
            FROM chunks
            WHERE collection = ?
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = row_to_chunk(row)?;
            if !filter.matches(&chunk) {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            hits.push(IndexHit {
                score: cosine_similarity(vector, &blob_to_vec(&blob)) as f64,
                chunk,
            });
        }
        rank_hits(&mut hits, k);
        Ok(hits)
    }

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let row = sqlx::query(&format!("{} WHERE c.name = ?", COLLECTION_SELECT))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.as_ref().map(row_to_info))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let rows = sqlx::query(&format!("{} ORDER BY c.name ASC", COLLECTION_SELECT))
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows.iter().map(row_to_info).collect())
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let removed = remove_collection(&mut tx, name).await?;
        tx.commit().await.map_err(storage)?;
        debug!(collection = name, removed, "collection deleted");
        Ok(removed > 0)
    }
}
