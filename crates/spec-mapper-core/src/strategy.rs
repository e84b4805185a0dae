//! Reasoning strategies for the THINK and ACT stages.
//!
//! The agent picks one [`Strategy`] per iteration from the retrieval
//! confidence band ([`Strategy::select`]) and asks it for a
//! [`Proposal`]: a thought plus a concrete [`MappingCandidate`].
//!
//! Every strategy skips target paths already rejected in the field's
//! history, so each iteration tries something new.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::embedding::tokens;
use crate::models::{
    Chunk, ChunkKind, IterationRecord, MappingCandidate, MappingField, RetrievalResult,
    TargetField,
};
use crate::validator::{base_type, declared_json_type, json_types_compatible};

/// Top raw similarity at or above which retrieval alone counts as a direct match.
pub const DIRECT_MATCH_SCORE: f64 = 0.75;

const NAME_WEIGHT: f64 = 0.55;
const RETRIEVAL_WEIGHT: f64 = 0.35;
const TYPE_WEIGHT: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// The field name (or a synonym) matches a target, or retrieval is very confident.
    DirectMatch,
    /// Retrieval found relevant content above the threshold.
    SemanticMatch,
    /// Nothing usable above the threshold; explore low-similarity content.
    NoMatch,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::DirectMatch => "direct_match",
            Strategy::SemanticMatch => "semantic_match",
            Strategy::NoMatch => "no_match",
        }
    }

    /// Pick a strategy from thresholded retrieval results.
    pub fn select(
        field: &MappingField,
        results: &[RetrievalResult],
        history: &[IterationRecord],
    ) -> Strategy {
        let rejected = rejected_paths(history);
        let open: Vec<(&RetrievalResult, TargetField)> = results
            .iter()
            .flat_map(|r| chunk_targets(&r.payload).into_iter().map(move |t| (r, t)))
            .filter(|(_, t)| !rejected.contains(t.path.as_str()))
            .collect();

        if open.is_empty() {
            return Strategy::NoMatch;
        }
        let names = field_names(field);
        let exact = open.iter().any(|(_, t)| names.contains(&normalize(t.leaf())));
        let top = open
            .iter()
            .map(|(r, _)| r.raw_score)
            .fold(f64::MIN, f64::max);
        if exact || top >= DIRECT_MATCH_SCORE {
            Strategy::DirectMatch
        } else {
            Strategy::SemanticMatch
        }
    }

    /// Think and act: produce the next candidate, or `None` when every
    /// target in `results` has already been rejected.
    pub fn propose(
        &self,
        field: &MappingField,
        results: &[RetrievalResult],
        history: &[IterationRecord],
    ) -> Option<Proposal> {
        let rejected = rejected_paths(history);
        let names = field_names(field);
        let source_type = declared_json_type(&field.declared_type);

        let mut best: Option<(f64, f64, &RetrievalResult, TargetField)> = None;
        for result in results {
            for target in chunk_targets(&result.payload) {
                if rejected.contains(target.path.as_str()) {
                    continue;
                }
                let similarity = name_similarity(&names, target.leaf());
                let type_fit = if json_types_compatible(source_type, base_type(&target.type_label)) {
                    1.0
                } else {
                    0.0
                };
                let score = match self {
                    // Exact names dominate; retrieval breaks ties.
                    Strategy::DirectMatch => similarity * 0.8 + result.raw_score.clamp(0.0, 1.0) * 0.2,
                    _ => {
                        similarity * NAME_WEIGHT
                            + result.raw_score.clamp(0.0, 1.0) * RETRIEVAL_WEIGHT
                            + type_fit * TYPE_WEIGHT
                    }
                };
                if best.as_ref().map_or(true, |(s, _, _, _)| score > *s) {
                    best = Some((score, similarity, result, target));
                }
            }
        }

        let (_, similarity, result, target) = best?;
        let transformation = transformation(field, &target);
        let thought = self.thought(field, &target, result, similarity, history);
        let rationale = format!(
            "{} chunk {} (raw {:.2}, combined {:.2}, matched \"{}\"); name similarity {:.2}; target type {}",
            result.payload.kind,
            result.payload.structural_path,
            result.raw_score,
            result.combined_score,
            result.matched_query,
            similarity,
            target.type_label
        );
        Some(Proposal {
            thought,
            candidate: MappingCandidate {
                target_path: target.path.clone(),
                transformation,
                rationale,
            },
            target,
            retrieval_score: result.raw_score,
        })
    }

    fn thought(
        &self,
        field: &MappingField,
        target: &TargetField,
        result: &RetrievalResult,
        similarity: f64,
        history: &[IterationRecord],
    ) -> String {
        let mut thought = match self {
            Strategy::DirectMatch => format!(
                "'{}' lines up with '{}' (name similarity {:.2}, retrieval {:.2}).",
                field.name, target.path, similarity, result.raw_score
            ),
            Strategy::SemanticMatch => format!(
                "No exact name match for '{}'; '{}' from {} is the closest semantic neighbour (retrieval {:.2}).",
                field.name, target.path, result.payload.structural_path, result.raw_score
            ),
            Strategy::NoMatch => format!(
                "Nothing relevant to '{}' above the threshold; exploring '{}' (retrieval {:.2}).",
                field.name, target.path, result.raw_score
            ),
        };

        let rejections: Vec<String> = history
            .iter()
            .filter_map(|r| {
                r.candidate.as_ref().map(|c| {
                    format!("{} scored {:.2} ({})", c.target_path, r.validation_score, r.validation_detail)
                })
            })
            .collect();
        if !rejections.is_empty() {
            thought.push_str(" Rejected so far: ");
            thought.push_str(&rejections.join("; "));
            thought.push('.');
        }
        thought
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy's output for one iteration.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub thought: String,
    pub candidate: MappingCandidate,
    pub target: TargetField,
    /// Raw similarity of the chunk the candidate came from.
    pub retrieval_score: f64,
}

/// Target paths of every candidate already tried.
pub fn rejected_paths(history: &[IterationRecord]) -> HashSet<&str> {
    history
        .iter()
        .filter_map(|r| r.candidate.as_ref().map(|c| c.target_path.as_str()))
        .collect()
}

/// Targets described by a chunk.
///
/// Chunks produced by the chunker carry their targets. For property
/// chunks that do not, `name: type` lines in the text are read as
/// properties of the chunk's schema.
pub fn chunk_targets(chunk: &Chunk) -> Vec<TargetField> {
    if !chunk.targets.is_empty() {
        return chunk.targets.clone();
    }
    if chunk.kind != ChunkKind::SchemaProperties {
        return Vec::new();
    }

    let owner = chunk
        .structural_path
        .trim_start_matches("Schema.")
        .trim_end_matches(".*")
        .to_string();

    let mut out = Vec::new();
    for line in chunk.text.lines() {
        let line = line.trim().trim_start_matches("- ");
        let (name, rest) = match line.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };
        let name = name.trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            continue;
        }
        let type_label = rest
            .split(',')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        let path = if owner.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", owner, name)
        };
        out.push(TargetField {
            path,
            type_label: if type_label.is_empty() { "any".to_string() } else { type_label },
            format: None,
            enum_values: Vec::new(),
        });
    }
    out
}

fn normalize(name: &str) -> String {
    tokens(name).join("_")
}

/// Normalized name plus synonyms of a field.
fn field_names(field: &MappingField) -> Vec<String> {
    let mut names = vec![normalize(&field.name)];
    names.extend(field.synonyms.iter().map(|s| normalize(s)));
    names.retain(|n| !n.is_empty());
    names
}

/// Best token Jaccard similarity between any field name and a target leaf.
pub fn name_similarity(names: &[String], leaf: &str) -> f64 {
    let leaf_tokens: HashSet<String> = tokens(leaf).into_iter().collect();
    if leaf_tokens.is_empty() {
        return 0.0;
    }
    names
        .iter()
        .map(|n| {
            let name_tokens: HashSet<String> = n.split('_').map(str::to_string).collect();
            let inter = name_tokens.intersection(&leaf_tokens).count() as f64;
            let union = name_tokens.union(&leaf_tokens).count() as f64;
            if union == 0.0 {
                0.0
            } else {
                inter / union
            }
        })
        .fold(0.0, f64::max)
}

/// The rule needed to move a source value into a target.
pub fn transformation(field: &MappingField, target: &TargetField) -> String {
    if !target.enum_values.is_empty() {
        return "enum translation".to_string();
    }
    let declared = field.declared_type.to_ascii_lowercase();
    let target_is_date = matches!(target.format.as_deref(), Some("date") | Some("date-time"))
        || target.type_label.contains("date");
    if target_is_date && declared.starts_with("date") {
        let source_format = if declared == "date" { "date" } else { "date-time" };
        return match target.format.as_deref() {
            Some(f) if f != source_format => format!("date format conversion {} -> {}", source_format, f),
            _ => "direct".to_string(),
        };
    }
    let source = declared_json_type(&field.declared_type);
    let expected = base_type(&target.type_label);
    if json_types_compatible(source, expected) {
        "direct".to_string()
    } else {
        format!("type conversion {} -> {}", source, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, raw: f64, targets: &[(&str, &str)]) -> RetrievalResult {
        RetrievalResult {
            chunk_id: id.to_string(),
            raw_score: raw,
            combined_score: raw,
            structural_bonus: 0.0,
            matched_query: "q".into(),
            payload: Chunk {
                id: id.to_string(),
                kind: ChunkKind::SchemaProperties,
                structural_path: format!("Schema.{}.*", id),
                text: String::new(),
                parent_id: None,
                method: None,
                targets: targets
                    .iter()
                    .map(|(p, t)| TargetField {
                        path: p.to_string(),
                        type_label: t.to_string(),
                        format: None,
                        enum_values: Vec::new(),
                    })
                    .collect(),
            },
        }
    }

    fn rejected(path: &str, index: u32) -> IterationRecord {
        IterationRecord {
            iteration_index: index,
            strategy: Strategy::SemanticMatch,
            thought: String::new(),
            candidate: Some(MappingCandidate {
                target_path: path.to_string(),
                transformation: "direct".into(),
                rationale: String::new(),
            }),
            validation_score: 0.1,
            validation_detail: "not found".into(),
            success: false,
            top_retrieval_score: None,
        }
    }

    #[test]
    fn test_select_bands() {
        let field = MappingField::new("employee_id", "string");
        assert_eq!(Strategy::select(&field, &[], &[]), Strategy::NoMatch);

        let exact = [result("Employee", 0.3, &[("Employee.employeeId", "string")])];
        assert_eq!(Strategy::select(&field, &exact, &[]), Strategy::DirectMatch);

        let strong = [result("Staff", 0.8, &[("Staff.number", "string")])];
        assert_eq!(Strategy::select(&field, &strong, &[]), Strategy::DirectMatch);

        let weak = [result("Staff", 0.4, &[("Staff.number", "string")])];
        assert_eq!(Strategy::select(&field, &weak, &[]), Strategy::SemanticMatch);

        let history = [rejected("Staff.number", 1)];
        assert_eq!(Strategy::select(&field, &weak, &history), Strategy::NoMatch);
    }

    #[test]
    fn test_synonym_counts_as_exact() {
        let field = MappingField::new("emp_no", "string").with_synonyms(&["staffNumber"]);
        let results = [result("Staff", 0.2, &[("Staff.staff_number", "string")])];
        assert_eq!(Strategy::select(&field, &results, &[]), Strategy::DirectMatch);
    }

    #[test]
    fn test_propose_prefers_name_match_and_skips_rejected() {
        let field = MappingField::new("employee_id", "string");
        let results = [
            result("A", 0.6, &[("A.name", "string"), ("A.employeeId", "string")]),
            result("B", 0.5, &[("B.employee_id", "integer")]),
        ];
        let p = Strategy::DirectMatch.propose(&field, &results, &[]).unwrap();
        assert_eq!(p.candidate.target_path, "A.employeeId");
        assert_eq!(p.candidate.transformation, "direct");

        let history = [rejected("A.employeeId", 1)];
        let p = Strategy::DirectMatch.propose(&field, &results, &history).unwrap();
        assert_eq!(p.candidate.target_path, "B.employee_id");
        assert_eq!(p.candidate.transformation, "type conversion string -> integer");
        assert!(p.thought.contains("Rejected so far: A.employeeId scored 0.10"));

        let history = [rejected("A.employeeId", 1), rejected("B.employee_id", 2), rejected("A.name", 3)];
        assert!(Strategy::SemanticMatch.propose(&field, &results, &history).is_none());
    }

    #[test]
    fn test_chunk_targets_from_text() {
        let chunk = Chunk {
            id: "x".into(),
            kind: ChunkKind::SchemaProperties,
            structural_path: "Schema.Employee.*".into(),
            text: "employeeId: string\nSchema Employee properties:\n- hire_date: string(date), required".into(),
            parent_id: None,
            method: None,
            targets: Vec::new(),
        };
        let targets = chunk_targets(&chunk);
        let paths: Vec<&str> = targets.iter().map(|t| t.path.as_str()).collect();
        assert_eq!(paths, vec!["Employee.employeeId", "Employee.hire_date"]);
        assert_eq!(targets[1].type_label, "string(date)");
    }

    #[test]
    fn test_transformation_rules() {
        let mut target = TargetField {
            path: "Absence.type".into(),
            type_label: "string".into(),
            format: None,
            enum_values: vec!["sick".into()],
        };
        let field = MappingField::new("absence_kind", "string");
        assert_eq!(transformation(&field, &target), "enum translation");

        target.enum_values.clear();
        target.format = Some("date".into());
        target.type_label = "string(date)".into();
        let field = MappingField::new("start", "datetime");
        assert_eq!(transformation(&field, &target), "date format conversion date-time -> date");
        let field = MappingField::new("start", "date");
        assert_eq!(transformation(&field, &target), "direct");
    }

    #[test]
    fn test_name_similarity() {
        let names = vec!["employee_id".to_string()];
        assert_eq!(name_similarity(&names, "employeeId"), 1.0);
        assert!((name_similarity(&names, "employee") - 0.5).abs() < 1e-9);
        assert_eq!(name_similarity(&names, "total"), 0.0);
    }
}
