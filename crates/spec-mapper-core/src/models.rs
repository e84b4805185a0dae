//! Core data models shared by ingestion, retrieval and the mapping agent.
//!
//! Chunks and collections describe the indexed specification; fields,
//! candidates, iteration records and results describe one mapping run.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::strategy::Strategy;

/// What part of the specification a chunk renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Endpoint,
    SchemaSummary,
    SchemaProperties,
    Parameter,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Endpoint => "endpoint",
            ChunkKind::SchemaSummary => "schema_summary",
            ChunkKind::SchemaProperties => "schema_properties",
            ChunkKind::Parameter => "parameter",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "endpoint" => Ok(ChunkKind::Endpoint),
            "schema_summary" => Ok(ChunkKind::SchemaSummary),
            "schema_properties" => Ok(ChunkKind::SchemaProperties),
            "parameter" => Ok(ChunkKind::Parameter),
            other => Err(format!(
                "unknown chunk kind '{}': expected endpoint, schema_summary, schema_properties or parameter",
                other
            )),
        }
    }
}

/// A concrete location in the target API that a source field can map to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetField {
    /// Dot-notation path, e.g. `Absence.start_date` or `createAbsence.employeeId`.
    pub path: String,
    /// Rendered type, e.g. `string`, `integer(int64)`, `array of Employee`.
    pub type_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
}

impl TargetField {
    /// Last path segment, the property or parameter name.
    pub fn leaf(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }
}

/// The atomic retrievable unit of a collection.
///
/// Chunks are immutable: the `id` is a SHA-256 over kind, structural path
/// and text, so identical content always produces the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub kind: ChunkKind,
    pub structural_path: String,
    pub text: String,
    /// Weak back-reference to the owning endpoint or schema summary chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// HTTP method for endpoint and parameter chunks (upper case).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Target fields this chunk describes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetField>,
}

/// A chunk paired with its embedding, ready for [`VectorIndex::upsert`](crate::store::VectorIndex::upsert).
#[derive(Debug, Clone)]
pub struct IndexPoint {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Metadata describing a published collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    /// Where the specification came from (file path or URL).
    pub source: String,
    pub ingested_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub model: String,
    pub dims: usize,
}

/// One scored hit returned by the retrieval engine.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    /// Cosine similarity reported by the vector index.
    pub raw_score: f64,
    /// `raw_score * w1 + structural_bonus * w2`.
    pub combined_score: f64,
    pub structural_bonus: f64,
    /// The query formulation that produced the best score for this chunk.
    pub matched_query: String,
    pub payload: Chunk,
}

/// A source field under analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingField {
    pub name: String,
    /// Dot-notation location in the source payload.
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_declared_type")]
    pub declared_type: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    /// Business importance, 1 (low) to 5 (critical).
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Representative value from the source payload, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
}

fn default_declared_type() -> String {
    "string".to_string()
}

fn default_priority() -> u8 {
    3
}

impl MappingField {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
            declared_type: declared_type.into(),
            synonyms: Vec::new(),
            priority: default_priority(),
            example: None,
        }
    }

    pub fn with_synonyms(mut self, synonyms: &[&str]) -> Self {
        self.synonyms = synonyms.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Value submitted to validators: the recorded example, or one
    /// synthesized from `declared_type`.
    pub fn sample_value(&self) -> Option<Value> {
        if let Some(example) = &self.example {
            return Some(example.clone());
        }
        let sample = match self.declared_type.to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Value::from("sample"),
            "integer" | "int" | "int32" | "int64" | "long" => Value::from(1),
            "number" | "float" | "double" | "decimal" => Value::from(1.5),
            "boolean" | "bool" => Value::from(true),
            "date" => Value::from("2024-01-15"),
            "datetime" | "date-time" | "timestamp" => Value::from("2024-01-15T09:00:00Z"),
            "uuid" => Value::from("3fa85f64-5717-4562-b3fc-2c963f66afa6"),
            "email" => Value::from("jane.doe@example.com"),
            "array" | "list" => Value::Array(Vec::new()),
            "object" | "map" => Value::Object(serde_json::Map::new()),
            _ => return None,
        };
        Some(sample)
    }
}

/// One hypothesis produced during an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingCandidate {
    pub target_path: String,
    /// Free-text rule, e.g. `direct` or `enum translation`.
    pub transformation: String,
    pub rationale: String,
}

/// Append-only record of one Think→Act→Observe cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based, strictly increasing within one result.
    pub iteration_index: u32,
    pub strategy: Strategy,
    pub thought: String,
    pub candidate: Option<MappingCandidate>,
    pub validation_score: f64,
    pub validation_detail: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_retrieval_score: Option<f64>,
}

/// How a field's mapping was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    Converged,
    ExhaustedBestEffort,
    FallbackRag,
    Unmapped,
    UnmappedNoCandidates,
}

impl MappingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingMethod::Converged => "converged",
            MappingMethod::ExhaustedBestEffort => "exhausted_best_effort",
            MappingMethod::FallbackRag => "fallback_rag",
            MappingMethod::Unmapped => "unmapped",
            MappingMethod::UnmappedNoCandidates => "unmapped_no_candidates",
        }
    }
}

impl fmt::Display for MappingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal record for one field. Immutable once the aggregation layer
/// has handed it out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingResult {
    pub field_name: String,
    pub final_candidate: Option<MappingCandidate>,
    pub confidence: f64,
    pub method: MappingMethod,
    pub iterations: Vec<IterationRecord>,
    /// Why the field needs attention (infra failure, budget, no content).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl MappingResult {
    pub fn unmapped(field_name: &str, method: MappingMethod, note: impl Into<String>) -> Self {
        Self {
            field_name: field_name.to_string(),
            final_candidate: None,
            confidence: 0.0,
            method,
            iterations: Vec::new(),
            note: Some(note.into()),
        }
    }

    /// Highest validation score observed, `0.0` when nothing was validated.
    pub fn best_validation_score(&self) -> f64 {
        self.iterations
            .iter()
            .map(|r| r.validation_score)
            .fold(0.0, f64::max)
    }

    /// The iteration with the highest validation score among those that
    /// produced a candidate. Earlier iterations win ties.
    pub fn best_iteration(&self) -> Option<&IterationRecord> {
        best_of(&self.iterations)
    }
}

pub(crate) fn best_of(records: &[IterationRecord]) -> Option<&IterationRecord> {
    records
        .iter()
        .filter(|r| r.candidate.is_some())
        .fold(None, |best: Option<&IterationRecord>, r| match best {
            Some(b) if b.validation_score >= r.validation_score => Some(b),
            _ => Some(r),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u32, target: Option<&str>, score: f64) -> IterationRecord {
        IterationRecord {
            iteration_index: index,
            strategy: Strategy::SemanticMatch,
            thought: String::new(),
            candidate: target.map(|t| MappingCandidate {
                target_path: t.to_string(),
                transformation: "direct".to_string(),
                rationale: String::new(),
            }),
            validation_score: score,
            validation_detail: String::new(),
            success: false,
            top_retrieval_score: None,
        }
    }

    #[test]
    fn test_chunk_kind_roundtrip_str() {
        for kind in [
            ChunkKind::Endpoint,
            ChunkKind::SchemaSummary,
            ChunkKind::SchemaProperties,
            ChunkKind::Parameter,
        ] {
            assert_eq!(kind.as_str().parse::<ChunkKind>().unwrap(), kind);
        }
        assert!("schema".parse::<ChunkKind>().is_err());
    }

    #[test]
    fn test_sample_value_prefers_example() {
        let mut field = MappingField::new("hired_on", "date");
        assert_eq!(field.sample_value(), Some(Value::from("2024-01-15")));
        field.example = Some(Value::from("2019-03-01"));
        assert_eq!(field.sample_value(), Some(Value::from("2019-03-01")));
    }

    #[test]
    fn test_sample_value_unknown_type() {
        let field = MappingField::new("blob", "binary-ish");
        assert_eq!(field.sample_value(), None);
    }

    #[test]
    fn test_best_iteration_skips_candidate_less_records() {
        let result = MappingResult {
            field_name: "x".into(),
            final_candidate: None,
            confidence: 0.0,
            method: MappingMethod::ExhaustedBestEffort,
            iterations: vec![
                record(1, Some("A.x"), 0.3),
                record(2, None, 0.0),
                record(3, Some("B.x"), 0.35),
                record(4, Some("C.x"), 0.35),
            ],
            note: None,
        };
        let best = result.best_iteration().unwrap();
        assert_eq!(best.iteration_index, 3);
        assert!((result.best_validation_score() - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_mapping_field_defaults_from_json() {
        let field: MappingField = serde_json::from_str(r#"{"name": "employee_id"}"#).unwrap();
        assert_eq!(field.declared_type, "string");
        assert_eq!(field.priority, 3);
        assert!(field.synonyms.is_empty());
    }

    #[test]
    fn test_method_serializes_snake_case() {
        let json = serde_json::to_string(&MappingMethod::ExhaustedBestEffort).unwrap();
        assert_eq!(json, "\"exhausted_best_effort\"");
    }
}
