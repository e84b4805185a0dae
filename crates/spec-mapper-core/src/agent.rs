//! Iterative field-mapping agent.
//!
//! For one [`MappingField`] the agent runs a bounded loop:
//!
//! ```text
//! START → THINKING → ACTING → OBSERVING → { THINKING | CONVERGED | EXHAUSTED }
//! ```
//!
//! - **THINKING**: a field-oriented retrieval query (broadened with
//!   every iteration), a [`Strategy`] chosen from the confidence band,
//!   and a thought that accounts for earlier rejections.
//! - **ACTING**: the strategy's [`MappingCandidate`].
//! - **OBSERVING**: the [`Validator`] scores the candidate with the
//!   field's sample value; the outcome is appended as an
//!   [`IterationRecord`].
//!
//! The loop converges as soon as a score exceeds
//! `convergence_threshold`. After `max_iterations` (or when the
//! strategies run out of untried targets) the best iteration is reported
//! as `exhausted_best_effort` with its score discounted by
//! `exhausted_penalty`.
//!
//! Infrastructure failures that survive [`RetryPolicy`] retries turn the
//! iteration into a zero-score record. After
//! `max_consecutive_infra_failures` such iterations in a row the agent
//! gives up with [`MapError::Abandoned`], carrying the history it built.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::MapError;
use crate::models::{
    best_of, IterationRecord, MappingField, MappingMethod, MappingResult, RetrievalResult,
};
use crate::retry::RetryPolicy;
use crate::search::{QueryIntent, QueryRequest, Retriever};
use crate::strategy::{Proposal, Strategy};
use crate::validator::Validator;

/// Loop bounds and thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub max_iterations: u32,
    /// A validation score strictly above this converges.
    pub convergence_threshold: f64,
    /// Multiplier applied to the best score of an exhausted run.
    pub exhausted_penalty: f64,
    /// Results requested on the first iteration; iteration `n` asks for `n × k`.
    pub k: usize,
    pub score_threshold: f64,
    pub max_consecutive_infra_failures: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            convergence_threshold: 0.7,
            exhausted_penalty: 0.9,
            k: 5,
            score_threshold: 0.15,
            max_consecutive_infra_failures: 3,
        }
    }
}

/// States of the per-field loop, used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Thinking,
    Acting,
    Observing,
    Converged,
    Exhausted,
}

/// The agent raised instead of finishing. Iterations recorded before
/// the failure are kept for the fallback layer.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct AgentFailure {
    pub error: MapError,
    pub iterations: Vec<IterationRecord>,
}

/// Output of the THINK stage.
struct Thought {
    strategy: Strategy,
    proposal: Option<Proposal>,
    top_score: Option<f64>,
}

/// Runs the Think→Act→Observe loop for one field at a time.
///
/// Holds only shared, read-only handles; one mapper serves every field
/// of a run concurrently.
pub struct IterativeMapper {
    retriever: Retriever,
    validator: Arc<dyn Validator>,
    retry: RetryPolicy,
    config: AgentConfig,
    collection: String,
}

impl IterativeMapper {
    pub fn new(
        retriever: Retriever,
        validator: Arc<dyn Validator>,
        retry: RetryPolicy,
        config: AgentConfig,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            retriever,
            validator,
            retry,
            config,
            collection: collection.into(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Map one field.
    ///
    /// `deadline` is checked before every new iteration; an iteration in
    /// progress always finishes.
    pub async fn map_field(
        &self,
        field: &MappingField,
        deadline: Option<Instant>,
    ) -> Result<MappingResult, AgentFailure> {
        let span = info_span!("map_field", field = %field.name);
        self.run_loop(field, deadline).instrument(span).await
    }

    async fn run_loop(
        &self,
        field: &MappingField,
        deadline: Option<Instant>,
    ) -> Result<MappingResult, AgentFailure> {
        let mut history: Vec<IterationRecord> = Vec::new();
        let mut infra_failures = 0u32;
        let mut note: Option<String> = None;
        let sample = field.sample_value();
        debug!(phase = ?Phase::Start, max_iterations = self.config.max_iterations);

        for iteration in 1..=self.config.max_iterations {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                note = Some(format!(
                    "run budget exceeded after {} iteration(s)",
                    history.len()
                ));
                warn!(iterations = history.len(), "run budget exceeded");
                break;
            }

            debug!(phase = ?Phase::Thinking, iteration);
            let thought = match self.think(field, &history, iteration).await {
                Ok(t) => t,
                Err(e) if e.is_retryable() => {
                    infra_failures += 1;
                    warn!(iteration, error = %e, "retrieval failed after retries");
                    history.push(IterationRecord {
                        iteration_index: iteration,
                        strategy: Strategy::NoMatch,
                        thought: format!("Retrieval failed for '{}'.", field.name),
                        candidate: None,
                        validation_score: 0.0,
                        validation_detail: format!("retrieval failed after retries: {}", e),
                        success: false,
                        top_retrieval_score: None,
                    });
                    if infra_failures >= self.config.max_consecutive_infra_failures {
                        return Err(self.abandon(field, infra_failures, history));
                    }
                    continue;
                }
                Err(e) => {
                    return Err(AgentFailure {
                        error: e,
                        iterations: history,
                    })
                }
            };

            let proposal = match thought.proposal {
                Some(p) => p,
                None if history.is_empty() => {
                    info!("no candidates in collection");
                    return Ok(MappingResult {
                        field_name: field.name.clone(),
                        final_candidate: None,
                        confidence: 0.0,
                        method: MappingMethod::UnmappedNoCandidates,
                        iterations: Vec::new(),
                        note: Some(format!(
                            "no target in collection '{}' relates to this field",
                            self.collection
                        )),
                    });
                }
                None => {
                    note = Some(format!(
                        "candidates exhausted after {} iteration(s)",
                        history.len()
                    ));
                    break;
                }
            };

            debug!(
                phase = ?Phase::Acting,
                iteration,
                strategy = %thought.strategy,
                target = %proposal.candidate.target_path
            );

            debug!(phase = ?Phase::Observing, iteration);
            let (score, detail) = match self
                .retry
                .run("validate", || {
                    self.validator
                        .validate(&proposal.candidate.target_path, sample.as_ref())
                })
                .await
            {
                Ok(attempted) => {
                    infra_failures = 0;
                    let recovered = attempted.recovered();
                    let score = attempted.value.score.clamp(0.0, 1.0);
                    let mut detail = attempted.value.detail;
                    if recovered {
                        detail = format!(
                            "{} [degraded: {} validator recovered after {} attempts]",
                            detail,
                            self.validator.name(),
                            attempted.attempts
                        );
                    }
                    (score, detail)
                }
                Err(MapError::InvalidRequest(msg)) => {
                    infra_failures = 0;
                    (0.0, format!("validator rejected request: {}", msg))
                }
                Err(e) if e.is_retryable() => {
                    infra_failures += 1;
                    warn!(iteration, error = %e, "validation failed after retries");
                    (0.0, format!("validator unavailable after retries: {}", e))
                }
                Err(e) => {
                    return Err(AgentFailure {
                        error: e,
                        iterations: history,
                    })
                }
            };

            let success = score > self.config.convergence_threshold;
            history.push(IterationRecord {
                iteration_index: iteration,
                strategy: thought.strategy,
                thought: proposal.thought,
                candidate: Some(proposal.candidate),
                validation_score: score,
                validation_detail: detail,
                success,
                top_retrieval_score: thought.top_score,
            });

            if success {
                info!(phase = ?Phase::Converged, iteration, score, "converged");
                let final_candidate = history.last().and_then(|r| r.candidate.clone());
                return Ok(MappingResult {
                    field_name: field.name.clone(),
                    final_candidate,
                    confidence: score,
                    method: MappingMethod::Converged,
                    iterations: history,
                    note: None,
                });
            }

            if infra_failures >= self.config.max_consecutive_infra_failures {
                return Err(self.abandon(field, infra_failures, history));
            }
        }

        Ok(self.exhausted(field, history, note))
    }

    /// THINK: retrieve, pick a strategy, propose.
    async fn think(
        &self,
        field: &MappingField,
        history: &[IterationRecord],
        iteration: u32,
    ) -> crate::error::Result<Thought> {
        let k = self.config.k.max(1) * iteration as usize;
        let intent = QueryIntent::Field {
            declared_type: field.declared_type.clone(),
            synonyms: field.synonyms.clone(),
        };

        let mut request = QueryRequest::new(&field.name, &self.collection, k, self.config.score_threshold);
        request.intent = intent;
        let confident = self.retriever.query(&request).await?;
        let strategy = Strategy::select(field, &confident, history);

        let pool: Vec<RetrievalResult> = if strategy == Strategy::NoMatch {
            // Broaden: drop the threshold and look further down the ranking.
            request.score_threshold = 0.0;
            request.k = k * 2;
            self.retriever.query(&request).await?
        } else {
            confident
        };

        let top_score = pool.first().map(|r| r.raw_score);
        let proposal = strategy.propose(field, &pool, history);
        Ok(Thought {
            strategy,
            proposal,
            top_score,
        })
    }

    fn exhausted(
        &self,
        field: &MappingField,
        history: Vec<IterationRecord>,
        note: Option<String>,
    ) -> MappingResult {
        let best = best_of(&history).map(|r| (r.validation_score, r.candidate.clone()));
        match best {
            Some((score, candidate)) => {
                let confidence = (score * self.config.exhausted_penalty).min(score);
                info!(
                    phase = ?Phase::Exhausted,
                    iterations = history.len(),
                    best = score,
                    confidence,
                    "exhausted"
                );
                MappingResult {
                    field_name: field.name.clone(),
                    final_candidate: candidate,
                    confidence,
                    method: MappingMethod::ExhaustedBestEffort,
                    iterations: history,
                    note,
                }
            }
            None => {
                let note = note.unwrap_or_else(|| {
                    format!("no candidate validated in {} iteration(s)", history.len())
                });
                MappingResult {
                    field_name: field.name.clone(),
                    final_candidate: None,
                    confidence: 0.0,
                    method: MappingMethod::Unmapped,
                    iterations: history,
                    note: Some(note),
                }
            }
        }
    }

    fn abandon(
        &self,
        field: &MappingField,
        failures: u32,
        history: Vec<IterationRecord>,
    ) -> AgentFailure {
        warn!(failures, "abandoning field after consecutive infrastructure failures");
        AgentFailure {
            error: MapError::Abandoned {
                field: field.name.clone(),
                reason: format!(
                    "{} consecutive iterations failed on unavailable infrastructure",
                    failures
                ),
            },
            iterations: history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedder, HashingEmbedder};
    use crate::error::Result;
    use crate::models::{Chunk, ChunkKind, IndexPoint, TargetField};
    use crate::search::RetrievalParams;
    use crate::store::memory::InMemoryIndex;
    use crate::store::{CollectionMeta, VectorIndex};
    use crate::validator::Validation;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn props_chunk(schema: &str, fields: &[&str]) -> Chunk {
        let text = std::iter::once(format!("Schema {} properties:", schema))
            .chain(fields.iter().map(|f| format!("- {}: string", f)))
            .collect::<Vec<_>>()
            .join("\n");
        Chunk {
            id: format!("{}-props", schema),
            kind: ChunkKind::SchemaProperties,
            structural_path: format!("Schema.{}.*", schema),
            text,
            parent_id: None,
            method: None,
            targets: fields
                .iter()
                .map(|f| TargetField {
                    path: format!("{}.{}", schema, f),
                    type_label: "string".into(),
                    format: None,
                    enum_values: Vec::new(),
                })
                .collect(),
        }
    }

    async fn retriever(chunks: Vec<Chunk>) -> Retriever {
        let embedder = Arc::new(HashingEmbedder::new(512));
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
            dims: 512,
        };
        index.upsert(&meta, &points).await.unwrap();
        Retriever::new(index, embedder, RetryPolicy::none(), RetrievalParams::default())
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            call_timeout: Duration::from_secs(1),
        }
    }

    /// Scores by substring match of the candidate path.
    struct SubstringValidator {
        needle: &'static str,
    }

    #[async_trait]
    impl Validator for SubstringValidator {
        fn name(&self) -> &str {
            "substring"
        }
        async fn validate(&self, path: &str, _: Option<&Value>) -> Result<Validation> {
            Ok(if path.contains(self.needle) {
                Validation::new(0.9, "exact match")
            } else {
                Validation::new(0.1, "not found")
            })
        }
    }

    struct ConstValidator(f64);

    #[async_trait]
    impl Validator for ConstValidator {
        fn name(&self) -> &str {
            "const"
        }
        async fn validate(&self, _: &str, _: Option<&Value>) -> Result<Validation> {
            Ok(Validation::new(self.0, "constant"))
        }
    }

    /// Takes `delay` per call, then scores a constant.
    struct SlowValidator {
        delay: Duration,
        score: f64,
    }

    #[async_trait]
    impl Validator for SlowValidator {
        fn name(&self) -> &str {
            "slow"
        }
        async fn validate(&self, _: &str, _: Option<&Value>) -> Result<Validation> {
            tokio::time::sleep(self.delay).await;
            Ok(Validation::new(self.score, "weak"))
        }
    }

    /// Unavailable for the first `failures` calls.
    struct FlakyValidator {
        failures: u32,
        calls: AtomicU32,
        paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Validator for FlakyValidator {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn validate(&self, path: &str, _: Option<&Value>) -> Result<Validation> {
            self.paths.lock().unwrap().push(path.to_string());
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(MapError::ValidatorUnavailable("503 Service Unavailable".into()))
            } else {
                Ok(Validation::new(0.85, "created"))
            }
        }
    }

    fn mapper(r: Retriever, v: Arc<dyn Validator>, retry: RetryPolicy) -> IterativeMapper {
        IterativeMapper::new(r, v, retry, AgentConfig::default(), "hr")
    }

    fn wide_collection() -> Vec<Chunk> {
        vec![
            props_chunk("Employee", &["employeeId", "name", "email"]),
            props_chunk("Invoice", &["total", "currency", "issued_on"]),
            props_chunk("Project", &["code", "budget"]),
        ]
    }

    #[tokio::test]
    async fn test_converges_in_one_iteration() {
        let r = retriever(vec![props_chunk("Employee", &["employeeId"])]).await;
        let m = mapper(r, Arc::new(SubstringValidator { needle: "employeeId" }), RetryPolicy::none());
        let result = m.map_field(&MappingField::new("employee_id", "string"), None).await.unwrap();
        assert_eq!(result.method, MappingMethod::Converged);
        assert_eq!(result.iterations.len(), 1);
        assert!((result.confidence - 0.9).abs() < 1e-9);
        assert_eq!(result.final_candidate.unwrap().target_path, "Employee.employeeId");
        assert_eq!(result.iterations[0].strategy, Strategy::DirectMatch);
    }

    #[tokio::test]
    async fn test_exhausts_after_max_iterations() {
        let r = retriever(wide_collection()).await;
        let m = mapper(r, Arc::new(ConstValidator(0.0)), RetryPolicy::none());
        let result = m.map_field(&MappingField::new("foo_bar_baz", "string"), None).await.unwrap();
        assert_eq!(result.method, MappingMethod::ExhaustedBestEffort);
        assert_eq!(result.iterations.len(), 5);
        assert_eq!(result.confidence, 0.0);
        let indices: Vec<u32> = result.iterations.iter().map(|r| r.iteration_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);

        let mut paths: Vec<String> = result
            .iterations
            .iter()
            .map(|r| r.candidate.as_ref().unwrap().target_path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 5, "every iteration tries a new target");
    }

    #[tokio::test]
    async fn test_exhausted_confidence_is_discounted_best() {
        let r = retriever(wide_collection()).await;
        let m = mapper(r, Arc::new(ConstValidator(0.5)), RetryPolicy::none());
        let result = m.map_field(&MappingField::new("employee_id", "string"), None).await.unwrap();
        assert_eq!(result.method, MappingMethod::ExhaustedBestEffort);
        assert!((result.confidence - 0.45).abs() < 1e-9);
        assert!(result.confidence <= result.best_validation_score());
        // Ties keep the earliest iteration.
        assert_eq!(
            result.final_candidate,
            result.iterations[0].candidate
        );
    }

    #[tokio::test]
    async fn test_stops_early_when_candidates_run_out() {
        let r = retriever(vec![props_chunk("Employee", &["employeeId", "name"])]).await;
        let m = mapper(r, Arc::new(ConstValidator(0.2)), RetryPolicy::none());
        let result = m.map_field(&MappingField::new("employee_id", "string"), None).await.unwrap();
        assert_eq!(result.method, MappingMethod::ExhaustedBestEffort);
        assert_eq!(result.iterations.len(), 2);
        assert!(result.note.unwrap().contains("candidates exhausted"));
    }

    #[tokio::test]
    async fn test_empty_collection_yields_no_candidates() {
        let r = retriever(vec![Chunk {
            id: "e".into(),
            kind: ChunkKind::Endpoint,
            structural_path: "GET /health".into(),
            text: "Endpoint GET /health".into(),
            parent_id: None,
            method: Some("GET".into()),
            targets: Vec::new(),
        }])
        .await;
        let m = mapper(r, Arc::new(ConstValidator(1.0)), RetryPolicy::none());
        let result = m.map_field(&MappingField::new("employee_id", "string"), None).await.unwrap();
        assert_eq!(result.method, MappingMethod::UnmappedNoCandidates);
        assert!(result.iterations.is_empty());
    }

    #[tokio::test]
    async fn test_validator_recovers_with_flagged_detail() {
        let r = retriever(vec![props_chunk("Employee", &["employeeId"])]).await;
        let v = Arc::new(FlakyValidator {
            failures: 3,
            calls: AtomicU32::new(0),
            paths: Mutex::new(Vec::new()),
        });
        let m = mapper(r, v.clone(), fast_retry());
        let result = m.map_field(&MappingField::new("employee_id", "string"), None).await.unwrap();
        assert_eq!(result.method, MappingMethod::Converged);
        assert_eq!(result.iterations.len(), 1);
        let record = &result.iterations[0];
        assert!((record.validation_score - 0.85).abs() < 1e-9);
        assert!(record.validation_detail.contains("degraded"));
        assert!(record.validation_detail.contains("4 attempts"));
        assert_eq!(v.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_abandons_after_consecutive_infra_failures() {
        let r = retriever(wide_collection()).await;
        let v = Arc::new(FlakyValidator {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            paths: Mutex::new(Vec::new()),
        });
        let m = mapper(r, v, RetryPolicy::none());
        let failure = m
            .map_field(&MappingField::new("employee_id", "string"), None)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, MapError::Abandoned { .. }));
        assert_eq!(failure.iterations.len(), 3);
        assert!(failure.iterations.iter().all(|r| r.validation_score == 0.0));
        assert!(failure.iterations[0].validation_detail.contains("validator unavailable"));
    }

    #[tokio::test]
    async fn test_missing_collection_surfaces() {
        let r = retriever(wide_collection()).await;
        let m = IterativeMapper::new(
            r,
            Arc::new(ConstValidator(1.0)),
            RetryPolicy::none(),
            AgentConfig::default(),
            "nope",
        );
        let failure = m
            .map_field(&MappingField::new("employee_id", "string"), None)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, MapError::CollectionNotFound(_)));
    }

    #[tokio::test]
    async fn test_expired_deadline_starts_no_iteration() {
        let r = retriever(wide_collection()).await;
        let m = mapper(r, Arc::new(ConstValidator(0.0)), RetryPolicy::none());
        let result = m
            .map_field(&MappingField::new("employee_id", "string"), Some(Instant::now()))
            .await
            .unwrap();
        assert_eq!(result.method, MappingMethod::Unmapped);
        assert!(result.iterations.is_empty());
        assert!(result.note.unwrap().contains("run budget exceeded"));
    }

    #[tokio::test]
    async fn test_deadline_mid_field_keeps_best_so_far() {
        let r = retriever(wide_collection()).await;
        let v = Arc::new(SlowValidator {
            delay: Duration::from_millis(300),
            score: 0.5,
        });
        let m = mapper(r, v, RetryPolicy::none());
        let deadline = Instant::now() + Duration::from_millis(200);
        let result = m
            .map_field(&MappingField::new("employee_id", "string"), Some(deadline))
            .await
            .unwrap();
        assert_eq!(result.method, MappingMethod::ExhaustedBestEffort);
        assert_eq!(result.iterations.len(), 1);
        assert!(result.iterations.len() < m.config().max_iterations as usize);
        assert!((result.confidence - 0.45).abs() < 1e-9);
        assert_eq!(result.final_candidate, result.iterations[0].candidate);
        assert!(result.note.unwrap().contains("run budget exceeded after 1 iteration(s)"));
    }
}
