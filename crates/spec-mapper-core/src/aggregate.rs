//! Fallback and aggregation.
//!
//! [`MappingRunner::run`] maps every field with bounded concurrency
//! (a [`Semaphore`] over a [`JoinSet`]), applies single-shot retrieval
//! fallback where the agent raised or stayed below `minimal_floor`, and
//! assembles a [`MappingReport`] in input order.
//!
//! Every input field ends with exactly one [`MappingResult`]: a task
//! that panics is reported as `unmapped` with a note, never dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::agent::{AgentFailure, IterativeMapper};
use crate::error::MapError;
use crate::models::{MappingCandidate, MappingField, MappingMethod, MappingResult};
use crate::search::{QueryIntent, QueryRequest};
use crate::strategy::Strategy;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateConfig {
    pub max_concurrency: usize,
    /// Agent results below this confidence go to fallback.
    pub minimal_floor: f64,
    /// Confidence given to every fallback result.
    pub fallback_confidence: f64,
    /// Wall-clock budget for the whole run.
    pub budget: Option<Duration>,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            minimal_floor: 0.3,
            fallback_confidence: 0.5,
            budget: None,
        }
    }
}

/// One line of the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    pub field: MappingField,
    pub result: MappingResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub converged: usize,
    pub exhausted: usize,
    pub fallback: usize,
    /// `unmapped` and `unmapped_no_candidates`.
    pub unmapped: usize,
    pub average_confidence: f64,
    /// Everything that is not `converged`.
    pub needs_review: usize,
}

impl ReportSummary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a MappingResult>) -> Self {
        let mut summary = ReportSummary::default();
        let mut confidence_sum = 0.0;
        for r in results {
            summary.total += 1;
            confidence_sum += r.confidence;
            match r.method {
                MappingMethod::Converged => summary.converged += 1,
                MappingMethod::ExhaustedBestEffort => summary.exhausted += 1,
                MappingMethod::FallbackRag => summary.fallback += 1,
                MappingMethod::Unmapped | MappingMethod::UnmappedNoCandidates => {
                    summary.unmapped += 1
                }
            }
        }
        if summary.total > 0 {
            summary.average_confidence = confidence_sum / summary.total as f64;
        }
        summary.needs_review = summary.total - summary.converged;
        summary
    }
}

/// Ordered result of one mapping run, ready for downstream code generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingReport {
    pub run_id: String,
    pub collection: String,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<ReportEntry>,
    pub summary: ReportSummary,
}

impl MappingReport {
    pub fn new(collection: &str, entries: Vec<ReportEntry>) -> Self {
        let summary = ReportSummary::from_results(entries.iter().map(|e| &e.result));
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            collection: collection.to_string(),
            generated_at: Utc::now(),
            entries,
            summary,
        }
    }

    pub fn result(&self, field_name: &str) -> Option<&MappingResult> {
        self.entries
            .iter()
            .find(|e| e.field.name == field_name)
            .map(|e| &e.result)
    }
}

/// Runs the agent over a field list and applies fallback.
pub struct MappingRunner {
    mapper: Arc<IterativeMapper>,
    config: AggregateConfig,
}

impl MappingRunner {
    pub fn new(mapper: Arc<IterativeMapper>, config: AggregateConfig) -> Self {
        Self { mapper, config }
    }

    /// Map all fields. Never fails: per-field errors become results.
    pub async fn run(&self, fields: Vec<MappingField>) -> MappingReport {
        let deadline = self.config.budget.map(|b| Instant::now() + b);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        info!(
            fields = fields.len(),
            collection = self.mapper.collection(),
            concurrency = self.config.max_concurrency,
            "mapping run started"
        );

        for (idx, field) in fields.iter().cloned().enumerate() {
            let mapper = Arc::clone(&self.mapper);
            let semaphore = Arc::clone(&semaphore);
            let config = self.config.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => map_with_fallback(&mapper, &config, &field, deadline).await,
                    Err(_) => MappingResult::unmapped(
                        &field.name,
                        MappingMethod::Unmapped,
                        "worker pool closed before the field was scheduled",
                    ),
                };
                (idx, result)
            });
        }

        let mut slots: Vec<Option<MappingResult>> = vec![None; fields.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!(error = %e, "mapping task failed"),
            }
        }

        let entries: Vec<ReportEntry> = fields
            .into_iter()
            .zip(slots)
            .map(|(field, slot)| {
                let result = slot.unwrap_or_else(|| {
                    MappingResult::unmapped(
                        &field.name,
                        MappingMethod::Unmapped,
                        "mapping task failed unexpectedly",
                    )
                });
                ReportEntry { field, result }
            })
            .collect();

        let report = MappingReport::new(self.mapper.collection(), entries);
        info!(
            converged = report.summary.converged,
            exhausted = report.summary.exhausted,
            fallback = report.summary.fallback,
            unmapped = report.summary.unmapped,
            "mapping run finished"
        );
        report
    }
}

/// Agent first; fallback when it raised or stayed below the floor.
async fn map_with_fallback(
    mapper: &IterativeMapper,
    config: &AggregateConfig,
    field: &MappingField,
    deadline: Option<Instant>,
) -> MappingResult {
    let outcome = mapper.map_field(field, deadline).await;

    let (iterations, agent_result, reason) = match outcome {
        Ok(result) if result.confidence >= config.minimal_floor => return result,
        // Exploratory retrieval already came up empty.
        Ok(result) if result.method == MappingMethod::UnmappedNoCandidates => return result,
        Ok(result) => {
            let reason = format!(
                "agent confidence {:.2} below floor {:.2}",
                result.confidence, config.minimal_floor
            );
            (result.iterations.clone(), Some(result), reason)
        }
        Err(AgentFailure { error, iterations }) => {
            warn!(field = %field.name, error = %error, "agent raised");
            (iterations, None, format!("agent failed: {}", error))
        }
    };

    if deadline.is_some_and(|d| Instant::now() >= d) {
        return agent_result.unwrap_or_else(|| {
            let mut r = MappingResult::unmapped(
                &field.name,
                MappingMethod::Unmapped,
                format!("{}; run budget exceeded before fallback", reason),
            );
            r.iterations = iterations;
            r
        });
    }

    match fallback_candidate(mapper, field).await {
        Ok(Some(candidate)) => {
            info!(field = %field.name, target = %candidate.target_path, "fallback used");
            MappingResult {
                field_name: field.name.clone(),
                final_candidate: Some(candidate),
                confidence: config.fallback_confidence,
                method: MappingMethod::FallbackRag,
                iterations,
                note: Some(format!("{}; single-shot retrieval fallback, needs review", reason)),
            }
        }
        Ok(None) => agent_result.unwrap_or_else(|| {
            let mut r = MappingResult::unmapped(
                &field.name,
                MappingMethod::Unmapped,
                format!("{}; fallback retrieval found nothing", reason),
            );
            r.iterations = iterations;
            r
        }),
        Err(e) => {
            let note = format!("{}; fallback retrieval failed: {}", reason, e);
            match agent_result {
                Some(mut r) => {
                    r.note = Some(note);
                    r
                }
                None => {
                    let mut r = MappingResult::unmapped(&field.name, MappingMethod::Unmapped, note);
                    r.iterations = iterations;
                    r
                }
            }
        }
    }
}

/// One unfiltered retrieval call, wrapping the top hit.
async fn fallback_candidate(
    mapper: &IterativeMapper,
    field: &MappingField,
) -> Result<Option<MappingCandidate>, MapError> {
    let mut request = QueryRequest::new(&field.name, mapper.collection(), 1, 0.0);
    request.intent = QueryIntent::Field {
        declared_type: field.declared_type.clone(),
        synonyms: field.synonyms.clone(),
    };
    let results = mapper.retriever().query(&request).await?;
    let top = match results.first() {
        Some(top) => top,
        None => return Ok(None),
    };

    if let Some(proposal) = Strategy::SemanticMatch.propose(field, &results, &[]) {
        return Ok(Some(proposal.candidate));
    }
    // A hit without targets still names a location worth reviewing.
    Ok(Some(MappingCandidate {
        target_path: top.payload.structural_path.clone(),
        transformation: "direct".to_string(),
        rationale: format!(
            "top retrieval hit {} (raw {:.2})",
            top.payload.structural_path, top.raw_score
        ),
    }))
}
