//! Source field descriptors.
//!
//! Fields come either from a JSON array of [`MappingField`] objects or
//! from a sample source payload, flattened into dot-notation paths with
//! inferred types and the payload's values as examples.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use spec_mapper_core::models::MappingField;

/// Read a `[{"name": ..., "declared_type": ...}, ...]` file.
pub fn load_fields(path: &Path) -> Result<Vec<MappingField>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read field file: {}", path.display()))?;
    let mut fields: Vec<MappingField> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse field file: {}", path.display()))?;
    for field in &mut fields {
        if field.path.is_empty() {
            field.path = field.name.clone();
        }
    }
    check_fields(&fields)?;
    Ok(fields)
}

/// Read a sample payload and derive one field per leaf value.
pub fn load_payload(path: &Path) -> Result<Vec<MappingField>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload file: {}", path.display()))?;
    let payload: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse payload file: {}", path.display()))?;
    let fields = fields_from_payload(&payload)?;
    check_fields(&fields)?;
    Ok(fields)
}

/// Names must be non-empty and unique: the report is keyed by them.
fn check_fields(fields: &[MappingField]) -> Result<()> {
    let mut seen = HashSet::new();
    for field in fields {
        if field.name.trim().is_empty() {
            bail!("field at '{}' has an empty name", field.path);
        }
        if !seen.insert(field.name.as_str()) {
            bail!("duplicate field name: {}", field.name);
        }
        if field.priority == 0 || field.priority > 5 {
            bail!("field {}: priority must be between 1 and 5", field.name);
        }
    }
    Ok(())
}

/// Flatten an object payload into fields.
///
/// Fields are named by their leaf key; when two leaves share a key both
/// are named by their full dotted path instead. Arrays are not descended.
pub fn fields_from_payload(payload: &Value) -> Result<Vec<MappingField>> {
    let obj = match payload {
        Value::Object(obj) => obj,
        _ => bail!("payload must be a JSON object"),
    };

    let mut leaves: Vec<(String, &Value)> = Vec::new();
    for (key, value) in obj {
        flatten(key.clone(), value, &mut leaves);
    }

    let mut leaf_counts: HashMap<&str, usize> = HashMap::new();
    for (path, _) in &leaves {
        *leaf_counts.entry(leaf(path)).or_default() += 1;
    }

    let fields = leaves
        .iter()
        .map(|(path, value)| {
            let name = if leaf_counts.get(leaf(path)).copied().unwrap_or(0) > 1 {
                path.clone()
            } else {
                leaf(path).to_string()
            };
            let mut field = MappingField::new(name, infer_type(value));
            field.path = path.clone();
            if !value.is_null() {
                field.example = Some((*value).clone());
            }
            field
        })
        .collect();
    Ok(fields)
}

fn flatten<'a>(path: String, value: &'a Value, out: &mut Vec<(String, &'a Value)>) {
    match value {
        Value::Object(obj) if !obj.is_empty() => {
            for (key, child) in obj {
                flatten(format!("{}.{}", path, key), child, out);
            }
        }
        _ => out.push((path, value)),
    }
}

fn leaf(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// Declared type for a sample value. Strings are sniffed for common formats.
pub fn infer_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "any",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::String(s) => {
            if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
                "date"
            } else if chrono::DateTime::parse_from_rfc3339(s).is_ok() {
                "datetime"
            } else if uuid::Uuid::parse_str(s).is_ok() {
                "uuid"
            } else if looks_like_email(s) {
                "email"
            } else {
                "string"
            }
        }
    }
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !s.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_payload() {
        let payload = json!({
            "employee": { "id": "E-1", "email": "jane@example.com" },
            "absence": { "id": 7, "from": "2024-01-15", "kind": "SICK_LEAVE" },
            "approved": true,
            "tags": ["a"]
        });
        let fields = fields_from_payload(&payload).unwrap();
        let by_name: HashMap<&str, &MappingField> =
            fields.iter().map(|f| (f.name.as_str(), f)).collect();

        assert_eq!(fields.len(), 7);
        assert_eq!(by_name["employee.id"].declared_type, "string");
        assert_eq!(by_name["absence.id"].declared_type, "integer");
        assert_eq!(by_name["email"].declared_type, "email");
        assert_eq!(by_name["from"].declared_type, "date");
        assert_eq!(by_name["from"].path, "absence.from");
        assert_eq!(by_name["kind"].example, Some(json!("SICK_LEAVE")));
        assert_eq!(by_name["approved"].declared_type, "boolean");
        assert_eq!(by_name["tags"].declared_type, "array");
    }

    #[test]
    fn test_payload_must_be_object() {
        assert!(fields_from_payload(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_field_file_defaults_and_duplicates() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("fields.json");
        std::fs::write(
            &path,
            r#"[{"name": "employee_id"}, {"name": "start_date", "declared_type": "date", "synonyms": ["from"]}]"#,
        )
        .unwrap();
        let fields = load_fields(&path).unwrap();
        assert_eq!(fields[0].declared_type, "string");
        assert_eq!(fields[0].priority, 3);
        assert_eq!(fields[1].synonyms, vec!["from".to_string()]);

        std::fs::write(&path, r#"[{"name": "a"}, {"name": "a"}]"#).unwrap();
        let err = load_fields(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate field name"));
    }

    #[test]
    fn test_infer_type() {
        assert_eq!(infer_type(&json!("2024-01-15T09:00:00Z")), "datetime");
        assert_eq!(infer_type(&json!("3fa85f64-5717-4562-b3fc-2c963f66afa6")), "uuid");
        assert_eq!(infer_type(&json!(1.5)), "number");
        assert_eq!(infer_type(&json!("hello world")), "string");
    }
}
