//! Retrieval engine: query text → ranked, deduplicated chunks.
//!
//! The engine works entirely through the [`VectorIndex`] and [`Embedder`]
//! traits and holds no state besides its handles and weights, so a
//! single [`Retriever`] can be shared across concurrent mapping tasks.
//!
//! # Algorithm
//!
//! 1. Build reformulations: the literal text, plus for field-oriented
//!    queries a humanized name, the synonyms and a type-qualified variant
//!    (`"employee id identifier"`, `"hire date date"`, ...).
//! 2. Embed all reformulations in one call.
//! 3. Search the index once per reformulation (`candidate_k` each) with
//!    the hard metadata filter.
//! 4. Score every hit: `combined = raw × w_semantic + bonus × w_structural`,
//!    where the structural bonus rewards the preferred chunk kind for the
//!    intent and a matching HTTP method.
//! 5. Union by chunk id, keeping the maximum combined score.
//! 6. Drop hits whose raw similarity is below `score_threshold`.
//! 7. Sort by combined (desc), raw (desc), chunk id (asc); truncate to `k`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::embedding::{tokens, Embedder};
use crate::error::Result;
use crate::models::{Chunk, ChunkKind, RetrievalResult};
use crate::retry::RetryPolicy;
use crate::store::{SearchFilter, VectorIndex};

/// Maximum number of query formulations embedded per call.
pub const MAX_REFORMULATIONS: usize = 6;

const PREFERRED_KIND_BONUS: f64 = 0.6;
const SECONDARY_KIND_BONUS: f64 = 0.3;
const METHOD_BONUS: f64 = 0.4;

/// Ranking weights, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    pub semantic_weight: f64,
    pub structural_weight: f64,
    /// Hits fetched from the index per reformulation.
    pub candidate_k: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            semantic_weight: 1.0,
            structural_weight: 0.15,
            candidate_k: 20,
        }
    }
}

/// What the caller is looking for. Drives reformulation and the
/// structural bonus.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum QueryIntent {
    /// Free text, literal query only, no kind preference.
    #[default]
    Plain,
    /// A source field: prefers `schema_properties`, then `parameter` chunks.
    Field {
        declared_type: String,
        synonyms: Vec<String>,
    },
    /// An operation: prefers `endpoint`, then `parameter` chunks.
    Operation,
}

/// One retrieval call.
#[derive(Debug, Clone)]
pub struct QueryRequest<'a> {
    pub text: &'a str,
    pub collection: &'a str,
    pub k: usize,
    /// Minimum raw similarity.
    pub score_threshold: f64,
    pub intent: QueryIntent,
    /// Hard filter applied by the index.
    pub filter: SearchFilter,
    /// Preferred HTTP methods (upper case). For operation queries left
    /// empty, methods are inferred from verbs in the text.
    pub methods: Vec<String>,
}

impl<'a> QueryRequest<'a> {
    pub fn new(text: &'a str, collection: &'a str, k: usize, score_threshold: f64) -> Self {
        Self {
            text,
            collection,
            k,
            score_threshold,
            intent: QueryIntent::Plain,
            filter: SearchFilter::default(),
            methods: Vec::new(),
        }
    }
}

/// Shared handle to the retrieval engine.
#[derive(Clone)]
pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    params: RetrievalParams,
}

impl Retriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        retry: RetryPolicy,
        params: RetrievalParams,
    ) -> Self {
        Self {
            index,
            embedder,
            retry,
            params,
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Run a query. Read-only over the index.
    ///
    /// Fails with `CollectionNotFound` for an unknown collection and with
    /// `RetrievalUnavailable` / `EmbeddingUnavailable` once retries on the
    /// index or embedder are exhausted.
    pub async fn query(&self, req: &QueryRequest<'_>) -> Result<Vec<RetrievalResult>> {
        if req.text.trim().is_empty() || req.k == 0 {
            return Ok(Vec::new());
        }

        let formulations = reformulate(req.text, &req.intent);
        let methods = if req.methods.is_empty() && req.intent == QueryIntent::Operation {
            infer_methods(req.text)
        } else {
            req.methods
                .iter()
                .map(|m| m.to_ascii_uppercase())
                .collect()
        };

        let vectors = self
            .retry
            .run("embed query", || self.embedder.embed_batch(&formulations))
            .await?
            .value;

        let candidate_k = self.params.candidate_k.max(req.k);
        let mut merged: HashMap<String, RetrievalResult> = HashMap::new();

        for (formulation, vector) in formulations.iter().zip(vectors.iter()) {
            let hits = self
                .retry
                .run("vector search", || {
                    self.index
                        .search(req.collection, vector, candidate_k, &req.filter)
                })
                .await?
                .value;

            for hit in hits {
                let bonus = structural_bonus(&hit.chunk, &req.intent, &methods);
                let combined = hit.score * self.params.semantic_weight
                    + bonus * self.params.structural_weight;
                let candidate = RetrievalResult {
                    chunk_id: hit.chunk.id.clone(),
                    raw_score: hit.score,
                    combined_score: combined,
                    structural_bonus: bonus,
                    matched_query: formulation.clone(),
                    payload: hit.chunk,
                };
                match merged.get(&candidate.chunk_id) {
                    Some(existing) if existing.combined_score >= candidate.combined_score => {}
                    _ => {
                        merged.insert(candidate.chunk_id.clone(), candidate);
                    }
                }
            }
        }

        let mut results: Vec<RetrievalResult> = merged
            .into_values()
            .filter(|r| r.raw_score >= req.score_threshold)
            .collect();
        rank_results(&mut results);
        results.truncate(req.k);

        debug!(
            collection = req.collection,
            query = req.text,
            formulations = formulations.len(),
            results = results.len(),
            "retrieval complete"
        );
        Ok(results)
    }
}

/// Sort by combined score (desc), raw score (desc), chunk id (asc).
pub fn rank_results(results: &mut [RetrievalResult]) {
    results.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.raw_score
                    .partial_cmp(&a.raw_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Query formulations for an intent, literal text first, deduplicated
/// case-insensitively and capped at [`MAX_REFORMULATIONS`].
pub fn reformulate(text: &str, intent: &QueryIntent) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |s: String| {
        let s = s.trim().to_string();
        if !s.is_empty()
            && out.len() < MAX_REFORMULATIONS
            && !out.iter().any(|o| o.eq_ignore_ascii_case(&s))
        {
            out.push(s);
        }
    };

    push(text.to_string());

    if let QueryIntent::Field {
        declared_type,
        synonyms,
    } = intent
    {
        let humanized = tokens(text).join(" ");
        push(humanized.clone());
        push(format!("{} {}", humanized, type_qualifier(text, declared_type)));
        for synonym in synonyms {
            push(synonym.clone());
            push(tokens(synonym).join(" "));
        }
    }

    out
}

/// The word appended to a field name in its type-qualified formulation.
pub fn type_qualifier(name: &str, declared_type: &str) -> String {
    let words = tokens(name);
    let last = words.last().map(String::as_str).unwrap_or("");
    let ty = declared_type.to_ascii_lowercase();

    if matches!(last, "id" | "uuid" | "guid" | "key" | "ref") || ty == "uuid" {
        "identifier".to_string()
    } else if ty.starts_with("date")
        || ty == "timestamp"
        || words.iter().any(|w| w == "date" || w == "day")
        || name.ends_with("_at")
    {
        "date".to_string()
    } else if ty == "enum" || matches!(last, "type" | "status" | "kind" | "category") {
        "enum value".to_string()
    } else {
        ty
    }
}

/// HTTP methods implied by the verbs in an operation query.
pub fn infer_methods(text: &str) -> Vec<String> {
    let words = tokens(text);
    let has = |candidates: &[&str]| words.iter().any(|w| candidates.contains(&w.as_str()));
    let mut methods: Vec<&str> = Vec::new();
    if has(&["create", "add", "new", "register", "submit", "insert"]) {
        methods.extend(["POST", "PUT"]);
    }
    if has(&["update", "modify", "change", "edit", "replace"]) {
        methods.extend(["PUT", "PATCH"]);
    }
    if has(&["delete", "remove", "cancel"]) {
        methods.push("DELETE");
    }
    if has(&["get", "list", "fetch", "find", "read", "search"]) {
        methods.push("GET");
    }
    let mut out: Vec<String> = Vec::new();
    for m in methods {
        if !out.iter().any(|o| o == m) {
            out.push(m.to_string());
        }
    }
    out
}

/// Structural reward in `[0, 1]` for a chunk under an intent.
pub fn structural_bonus(chunk: &Chunk, intent: &QueryIntent, methods: &[String]) -> f64 {
    let (preferred, secondary) = match intent {
        QueryIntent::Plain => (None, None),
        QueryIntent::Field { .. } => (Some(ChunkKind::SchemaProperties), Some(ChunkKind::Parameter)),
        QueryIntent::Operation => (Some(ChunkKind::Endpoint), Some(ChunkKind::Parameter)),
    };

    let mut bonus = 0.0;
    if preferred == Some(chunk.kind) {
        bonus += PREFERRED_KIND_BONUS;
    } else if secondary == Some(chunk.kind) {
        bonus += SECONDARY_KIND_BONUS;
    }

    if !methods.is_empty() {
        let method = chunk
            .method
            .clone()
            .or_else(|| chunk.structural_path.split_whitespace().next().map(str::to_string));
        if let Some(method) = method {
            if methods.iter().any(|m| m.eq_ignore_ascii_case(&method)) {
                bonus += METHOD_BONUS;
            }
        }
    }

    bonus.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::error::MapError;
    use crate::models::IndexPoint;
    use crate::store::memory::InMemoryIndex;
    use crate::store::{CollectionMeta, IndexHit};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn chunk(id: &str, kind: ChunkKind, path: &str, text: &str, method: Option<&str>) -> Chunk {
        Chunk {
            id: id.to_string(),
            kind,
            structural_path: path.to_string(),
            text: text.to_string(),
            parent_id: None,
            method: method.map(str::to_string),
            targets: Vec::new(),
        }
    }

    async fn retriever(chunks: Vec<Chunk>) -> Retriever {
        let embedder = Arc::new(HashingEmbedder::new(1024));
        let index = Arc::new(InMemoryIndex::new());
        let points: Vec<IndexPoint> = chunks
            .into_iter()
            .map(|c| IndexPoint {
                vector: embedder.embed_text(&c.text),
                chunk: c,
            })
            .collect();
        let meta = CollectionMeta {
            name: "hr".into(),
            source: "test".into(),
            model: embedder.model_name().to_string(),
            dims: 1024,
        };
        index.upsert(&meta, &points).await.unwrap();
        Retriever::new(index, embedder, RetryPolicy::none(), RetrievalParams::default())
    }

    fn corpus() -> Vec<Chunk> {
        vec![
            chunk("c1", ChunkKind::SchemaProperties, "Schema.Employee.*",
                  "Schema Employee properties:\n- employeeId: string", None),
            chunk("c2", ChunkKind::SchemaSummary, "Schema.Employee",
                  "Schema Employee\nType: object\nFields: employeeId, hire_date", None),
            chunk("c3", ChunkKind::Endpoint, "POST /employees",
                  "Endpoint POST /employees\nSummary: Create an employee record", Some("POST")),
            chunk("c4", ChunkKind::Endpoint, "GET /employees",
                  "Endpoint GET /employees\nResponses: 200 array of Employee", Some("GET")),
            chunk("c5", ChunkKind::SchemaProperties, "Schema.Invoice.*",
                  "Schema Invoice properties:\n- total: number\n- currency: string", None),
        ]
    }

    #[test]
    fn test_reformulate_field() {
        let intent = QueryIntent::Field {
            declared_type: "string".into(),
            synonyms: vec!["staffNumber".into()],
        };
        let f = reformulate("employee_id", &intent);
        assert_eq!(f[0], "employee_id");
        assert!(f.contains(&"employee id".to_string()));
        assert!(f.contains(&"employee id identifier".to_string()));
        assert!(f.contains(&"staffNumber".to_string()));
        assert!(f.contains(&"staff number".to_string()));
        assert!(f.len() <= MAX_REFORMULATIONS);
    }

    #[test]
    fn test_reformulate_plain_is_literal_only() {
        assert_eq!(reformulate("create absence", &QueryIntent::Plain), vec!["create absence"]);
    }

    #[test]
    fn test_type_qualifier() {
        assert_eq!(type_qualifier("employee_id", "string"), "identifier");
        assert_eq!(type_qualifier("created_at", "string"), "date");
        assert_eq!(type_qualifier("start", "date"), "date");
        assert_eq!(type_qualifier("absence_type", "string"), "enum value");
        assert_eq!(type_qualifier("amount", "number"), "number");
    }

    #[test]
    fn test_infer_methods() {
        assert_eq!(infer_methods("create an absence"), vec!["POST", "PUT"]);
        assert_eq!(infer_methods("list employees"), vec!["GET"]);
        assert!(infer_methods("absence").is_empty());
    }

    #[test]
    fn test_structural_bonus() {
        let props = chunk("a", ChunkKind::SchemaProperties, "Schema.A.*", "", None);
        let post = chunk("b", ChunkKind::Endpoint, "POST /a", "", Some("POST"));
        let field = QueryIntent::Field { declared_type: "string".into(), synonyms: vec![] };
        assert_eq!(structural_bonus(&props, &field, &[]), PREFERRED_KIND_BONUS);
        assert_eq!(structural_bonus(&post, &field, &[]), 0.0);
        let methods = vec!["POST".to_string()];
        assert_eq!(structural_bonus(&post, &QueryIntent::Operation, &methods), 1.0);
        assert_eq!(structural_bonus(&post, &QueryIntent::Plain, &methods), METHOD_BONUS);
    }

    #[tokio::test]
    async fn test_field_query_prefers_property_chunks() {
        let r = retriever(corpus()).await;
        let mut req = QueryRequest::new("employee_id", "hr", 3, 0.0);
        req.intent = QueryIntent::Field { declared_type: "string".into(), synonyms: vec![] };
        let results = r.query(&req).await.unwrap();
        assert_eq!(results[0].chunk_id, "c1");
        assert!(results.len() <= 3);
    }

    #[tokio::test]
    async fn test_results_sorted_and_deduplicated() {
        let r = retriever(corpus()).await;
        let mut req = QueryRequest::new("employee hire date", "hr", 10, 0.0);
        req.intent = QueryIntent::Field {
            declared_type: "date".into(),
            synonyms: vec!["start date".into(), "joined".into()],
        };
        let results = r.query(&req).await.unwrap();
        for pair in results.windows(2) {
            assert!(pair[0].combined_score >= pair[1].combined_score);
        }
        let mut ids: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[tokio::test]
    async fn test_operation_query_prefers_matching_method() {
        let r = retriever(corpus()).await;
        let mut req = QueryRequest::new("create employees", "hr", 2, 0.0);
        req.intent = QueryIntent::Operation;
        let results = r.query(&req).await.unwrap();
        assert_eq!(results[0].chunk_id, "c3");
    }

    #[tokio::test]
    async fn test_threshold_and_filter() {
        let r = retriever(corpus()).await;
        let mut req = QueryRequest::new("employee", "hr", 10, 0.99);
        assert!(r.query(&req).await.unwrap().is_empty());

        req.score_threshold = 0.0;
        req.filter.kinds = vec![ChunkKind::Endpoint];
        let results = r.query(&req).await.unwrap();
        assert!(results.iter().all(|r| r.payload.kind == ChunkKind::Endpoint));
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let r = retriever(corpus()).await;
        let err = r
            .query(&QueryRequest::new("employee", "missing", 5, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::CollectionNotFound(_)));
    }

    struct DownIndex {
        calls: AtomicU32,
    }

    #[async_trait]
    impl VectorIndex for DownIndex {
        async fn upsert(&self, _: &CollectionMeta, _: &[IndexPoint]) -> Result<usize> {
            Ok(0)
        }
        async fn replace(&self, _: &CollectionMeta, _: &[IndexPoint]) -> Result<usize> {
            Ok(0)
        }
        async fn search(&self, _: &str, _: &[f32], _: usize, _: &SearchFilter) -> Result<Vec<IndexHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(MapError::RetrievalUnavailable("connection reset".into()))
        }
        async fn collection(&self, _: &str) -> Result<Option<crate::models::CollectionInfo>> {
            Ok(None)
        }
        async fn list_collections(&self) -> Result<Vec<crate::models::CollectionInfo>> {
            Ok(Vec::new())
        }
        async fn delete_collection(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_unreachable_index_is_retried_then_surfaced() {
        let index = Arc::new(DownIndex { calls: AtomicU32::new(0) });
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
            call_timeout: std::time::Duration::from_secs(1),
        };
        let r = Retriever::new(
            index.clone(),
            Arc::new(HashingEmbedder::new(16)),
            policy,
            RetrievalParams::default(),
        );
        let err = r
            .query(&QueryRequest::new("employee", "hr", 5, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::RetrievalUnavailable(_)));
        assert_eq!(index.calls.load(Ordering::SeqCst), 3);
    }
}
