//! Candidate validation.
//!
//! A [`Validator`] scores how plausible it is that a source value belongs
//! at a candidate target path. Two implementations exist: the
//! [`SpecValidator`] below, which checks the parsed specification, and
//! the live HTTP validator in the `spec-mapper` app crate.
//!
//! Score bands used by [`SpecValidator`]:
//!
//! | Situation | Score |
//! |-----------|-------|
//! | path exists, sample type compatible (or no sample) | 0.9 |
//! | compatible type, format mismatch | 0.6 |
//! | compatible type, value not in enum | 0.4 |
//! | path exists, type mismatch | 0.35 |
//! | owner known, property unknown | 0.1 |
//! | owner unknown | 0.05 |

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::models::TargetField;
use crate::openapi::SpecDocument;

/// Score and explanation for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Validation {
    /// In `[0, 1]`.
    pub score: f64,
    pub detail: String,
}

impl Validation {
    pub fn new(score: f64, detail: impl Into<String>) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            detail: detail.into(),
        }
    }
}

/// Ground-truth check for a mapping candidate.
///
/// One call is one attempt. Transient failures must surface as
/// [`MapError::ValidatorUnavailable`](crate::error::MapError::ValidatorUnavailable)
/// or [`MapError::Timeout`](crate::error::MapError::Timeout) so the agent
/// can retry them; a malformed request is
/// [`MapError::InvalidRequest`](crate::error::MapError::InvalidRequest).
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, candidate_path: &str, sample: Option<&Value>) -> Result<Validation>;
}

/// Validates candidates against the target fields of a parsed document.
#[derive(Debug, Clone)]
pub struct SpecValidator {
    targets: BTreeMap<String, TargetField>,
    /// Schema names, operation keys and every intermediate target path.
    owners: BTreeSet<String>,
}

impl SpecValidator {
    pub fn new(doc: &SpecDocument) -> Self {
        let targets = doc.target_index();
        let mut owners: BTreeSet<String> = doc.schemas.iter().map(|s| s.name.clone()).collect();
        owners.extend(doc.operations.iter().map(|op| op.key()));
        owners.extend(targets.keys().cloned());
        Self { targets, owners }
    }

    pub fn target(&self, path: &str) -> Option<&TargetField> {
        self.targets.get(path)
    }

    /// Score a candidate synchronously.
    pub fn check(&self, candidate_path: &str, sample: Option<&Value>) -> Validation {
        let target = match self.targets.get(candidate_path) {
            Some(t) => t,
            None => {
                let owner = candidate_path
                    .rsplit_once('.')
                    .map(|(owner, _)| owner)
                    .unwrap_or("");
                return if self.owners.contains(owner) {
                    Validation::new(
                        0.1,
                        format!("{} has no property '{}'", owner, leaf(candidate_path)),
                    )
                } else {
                    Validation::new(0.05, format!("unknown target '{}'", candidate_path))
                };
            }
        };

        let expected = base_type(&target.type_label);
        let sample = match sample {
            Some(v) if !v.is_null() => v,
            _ => {
                return Validation::new(
                    0.9,
                    format!("{} exists ({}); no sample to type-check", target.path, target.type_label),
                )
            }
        };

        if !type_compatible(sample, expected) {
            return Validation::new(
                0.35,
                format!(
                    "{} exists but expects {}, sample is {}",
                    target.path,
                    target.type_label,
                    value_type(sample)
                ),
            );
        }

        if !target.enum_values.is_empty() {
            let rendered = match sample {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !target.enum_values.contains(&rendered) {
                return Validation::new(
                    0.4,
                    format!(
                        "{} is an enum [{}]; '{}' needs translation",
                        target.path,
                        target.enum_values.join(", "),
                        rendered
                    ),
                );
            }
        }

        if let (Some(format), Value::String(s)) = (&target.format, sample) {
            if !format_matches(format, s) {
                return Validation::new(
                    0.6,
                    format!("{} expects format {}, sample '{}' does not match", target.path, format, s),
                );
            }
        }

        Validation::new(
            0.9,
            format!("{} exists and accepts {}", target.path, value_type(sample)),
        )
    }
}

#[async_trait]
impl Validator for SpecValidator {
    fn name(&self) -> &str {
        "spec"
    }

    async fn validate(&self, candidate_path: &str, sample: Option<&Value>) -> Result<Validation> {
        Ok(self.check(candidate_path, sample))
    }
}

fn leaf(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// JSON type behind a rendered type label.
///
/// `string(date)` → `string`, `object (Employee)` → `object`,
/// `array of Employee` → `array`, `string (AbsenceType)` → `string`.
pub fn base_type(type_label: &str) -> &str {
    let head = type_label
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or(type_label);
    match head {
        "string" | "integer" | "number" | "boolean" | "array" | "object" => head,
        _ => "any",
    }
}

/// JSON type for a source field's declared type.
pub fn declared_json_type(declared: &str) -> &'static str {
    match declared.to_ascii_lowercase().as_str() {
        "integer" | "int" | "int32" | "int64" | "long" => "integer",
        "number" | "float" | "double" | "decimal" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" => "array",
        "object" | "map" => "object",
        "any" => "any",
        _ => "string",
    }
}

/// Whether a declared JSON type can be written to an expected one as is.
pub fn json_types_compatible(actual: &str, expected: &str) -> bool {
    actual == expected || expected == "any" || (actual == "integer" && expected == "number")
}

fn type_compatible(sample: &Value, expected: &str) -> bool {
    match expected {
        "any" => true,
        "string" => sample.is_string(),
        "integer" => sample.is_i64() || sample.is_u64(),
        "number" => sample.is_number(),
        "boolean" => sample.is_boolean(),
        "array" => sample.is_array(),
        "object" => sample.is_object(),
        _ => false,
    }
}

fn value_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn format_matches(format: &str, value: &str) -> bool {
    match format {
        "date" => chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok(),
        "date-time" => chrono::DateTime::parse_from_rfc3339(value).is_ok(),
        "uuid" => uuid::Uuid::parse_str(value).is_ok(),
        "email" => {
            let mut parts = value.splitn(2, '@');
            matches!((parts.next(), parts.next()), (Some(l), Some(d)) if !l.is_empty() && d.contains('.'))
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> SpecValidator {
        let doc = SpecDocument::parse(&json!({
            "openapi": "3.0.0",
            "paths": {
                "/absences": { "post": {
                    "operationId": "createAbsence",
                    "parameters": [ { "name": "dryRun", "in": "query",
                                      "schema": { "type": "boolean" } } ],
                    "responses": { "201": { "description": "ok" } } } }
            },
            "components": { "schemas": {
                "Absence": { "type": "object", "properties": {
                    "start_date": { "type": "string", "format": "date" },
                    "type": { "type": "string", "enum": ["sick", "vacation"] },
                    "days": { "type": "integer" },
                    "employee_id": { "type": "string", "format": "uuid" }
                } }
            } }
        }))
        .unwrap();
        SpecValidator::new(&doc)
    }

    #[test]
    fn test_exact_compatible() {
        let v = validator().check("Absence.start_date", Some(&json!("2024-01-15")));
        assert_eq!(v.score, 0.9);
        let v = validator().check("createAbsence.dryRun", Some(&json!(true)));
        assert_eq!(v.score, 0.9);
    }

    #[test]
    fn test_no_sample_scores_existence() {
        assert_eq!(validator().check("Absence.days", None).score, 0.9);
    }

    #[test]
    fn test_format_and_enum_mismatch() {
        assert_eq!(validator().check("Absence.start_date", Some(&json!("15/01/2024"))).score, 0.6);
        assert_eq!(validator().check("Absence.employee_id", Some(&json!("E-1"))).score, 0.6);
        let v = validator().check("Absence.type", Some(&json!("SICK_LEAVE")));
        assert_eq!(v.score, 0.4);
        assert!(v.detail.contains("needs translation"));
    }

    #[test]
    fn test_type_mismatch() {
        let v = validator().check("Absence.days", Some(&json!("three")));
        assert_eq!(v.score, 0.35);
        assert!(v.detail.contains("expects integer"));
    }

    #[test]
    fn test_unknown_property_and_schema() {
        let v = validator().check("Absence.reason", Some(&json!("x")));
        assert_eq!(v.score, 0.1);
        assert!(v.detail.contains("no property 'reason'"));
        assert_eq!(validator().check("Payroll.amount", None).score, 0.05);
    }

    #[test]
    fn test_base_type() {
        assert_eq!(base_type("string(date)"), "string");
        assert_eq!(base_type("object (Employee)"), "object");
        assert_eq!(base_type("array of Employee"), "array");
        assert_eq!(base_type("Money"), "any");
    }

    #[test]
    fn test_declared_type_compatibility() {
        assert_eq!(declared_json_type("int64"), "integer");
        assert_eq!(declared_json_type("date"), "string");
        assert!(json_types_compatible("integer", "number"));
        assert!(!json_types_compatible("string", "integer"));
    }
}
