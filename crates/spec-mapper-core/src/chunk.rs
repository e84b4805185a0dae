//! Specification chunker.
//!
//! Decomposes a [`SpecDocument`] into self-contained [`Chunk`]s:
//!
//! - one `schema_summary` chunk per schema (name, type, required fields,
//!   description, enum values),
//! - one `schema_properties` chunk per schema with properties, one line
//!   per property (type, format, enum values, example, description),
//! - one `endpoint` chunk per path + method (operation id, parameters,
//!   request and response schemas with their fields inlined),
//! - one `parameter` chunk per operation parameter.
//!
//! Chunk ids are the SHA-256 of `kind | structural_path | text`, so the
//! same document always produces the same ids and re-ingestion is a
//! no-op. Output order is deterministic: schemas by name, then
//! operations by path and method.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use spec_mapper_core::chunk::chunk_document;
//! use spec_mapper_core::openapi::SpecDocument;
//!
//! let doc = SpecDocument::parse(&json!({
//!     "openapi": "3.0.0",
//!     "paths": {},
//!     "components": { "schemas": {
//!         "Employee": { "type": "object",
//!             "properties": { "employeeId": { "type": "string" } } }
//!     } }
//! })).unwrap();
//! let chunks = chunk_document(&doc);
//! assert_eq!(chunks.len(), 2);
//! assert!(chunks[1].text.contains("employeeId: string"));
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Chunk, ChunkKind, TargetField};
use crate::openapi::{BodyDef, Operation, PropertyDef, SchemaDef, SpecDocument};

/// Maximum number of fields listed for a referenced body or response.
const MAX_LISTED_FIELDS: usize = 15;

/// Split a parsed document into chunks.
pub fn chunk_document(doc: &SpecDocument) -> Vec<Chunk> {
    let mut chunks = Vec::new();

    for schema in &doc.schemas {
        let summary = make_chunk(
            ChunkKind::SchemaSummary,
            format!("Schema.{}", schema.name),
            render_schema_summary(schema),
            None,
            None,
            Vec::new(),
        );
        let summary_id = summary.id.clone();
        chunks.push(summary);

        if !schema.properties.is_empty() {
            chunks.push(make_chunk(
                ChunkKind::SchemaProperties,
                format!("Schema.{}.*", schema.name),
                render_schema_properties(schema),
                Some(summary_id),
                None,
                schema.targets(),
            ));
        }
    }

    for op in &doc.operations {
        let endpoint = make_chunk(
            ChunkKind::Endpoint,
            op.signature(),
            render_endpoint(op, doc),
            None,
            Some(op.method.clone()),
            endpoint_targets(op, doc),
        );
        let endpoint_id = endpoint.id.clone();
        chunks.push(endpoint);

        let key = op.key();
        for param in &op.parameters {
            let mut text = format!(
                "Parameter {} of {}\nLocation: {}\nType: {}{}",
                param.name,
                op.signature(),
                param.location,
                param.type_label,
                if param.required { ", required" } else { "" },
            );
            if !param.enum_values.is_empty() {
                text.push_str(&format!("\nEnum values: {}", param.enum_values.join(", ")));
            }
            if let Some(desc) = &param.description {
                text.push_str(&format!("\nDescription: {}", desc));
            }
            chunks.push(make_chunk(
                ChunkKind::Parameter,
                format!("{}#{}", op.signature(), param.name),
                text,
                Some(endpoint_id.clone()),
                Some(op.method.clone()),
                vec![TargetField {
                    path: format!("{}.{}", key, param.name),
                    type_label: param.type_label.clone(),
                    format: param.format.clone(),
                    enum_values: param.enum_values.clone(),
                }],
            ));
        }
    }

    chunks
}

/// Deterministic chunk id.
pub fn chunk_id(kind: ChunkKind, structural_path: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(structural_path.as_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(
    kind: ChunkKind,
    structural_path: String,
    text: String,
    parent_id: Option<String>,
    method: Option<String>,
    targets: Vec<TargetField>,
) -> Chunk {
    Chunk {
        id: chunk_id(kind, &structural_path, &text),
        kind,
        structural_path,
        text,
        parent_id,
        method,
        targets,
    }
}

fn render_schema_summary(schema: &SchemaDef) -> String {
    let mut text = format!("Schema {}\nType: {}", schema.name, schema.schema_type);
    if !schema.required.is_empty() {
        text.push_str(&format!("\nRequired: {}", schema.required.join(", ")));
    }
    if let Some(desc) = &schema.description {
        text.push_str(&format!("\nDescription: {}", desc));
    }
    if !schema.enum_values.is_empty() {
        text.push_str(&format!("\nEnum values: {}", schema.enum_values.join(", ")));
    }
    if !schema.properties.is_empty() {
        let names: Vec<&str> = schema.properties.iter().map(|p| p.name.as_str()).collect();
        text.push_str(&format!("\nFields: {}", names.join(", ")));
    }
    text
}

fn render_schema_properties(schema: &SchemaDef) -> String {
    let mut text = format!("Schema {} properties:", schema.name);
    for prop in &schema.properties {
        render_property(prop, 0, &mut text);
    }
    text
}

/// One line per property, nested children indented.
fn render_property(prop: &PropertyDef, depth: usize, out: &mut String) {
    out.push('\n');
    out.push_str(&"  ".repeat(depth));
    out.push_str(&format!("- {}: {}", prop.name, prop.type_label));
    if prop.required {
        out.push_str(", required");
    }
    if let Some(format) = &prop.format {
        if !prop.type_label.contains(format.as_str()) {
            out.push_str(&format!(", format {}", format));
        }
    }
    if !prop.enum_values.is_empty() {
        out.push_str(&format!(", enum [{}]", prop.enum_values.join(", ")));
    }
    if !prop.ref_fields.is_empty() {
        out.push_str(&format!(" with fields {}", prop.ref_fields.join(", ")));
    }
    if let Some(example) = &prop.example {
        out.push_str(&format!(". Example: {}", example));
    }
    if let Some(desc) = &prop.description {
        out.push_str(&format!(". {}", desc));
    }
    for child in &prop.children {
        render_property(child, depth + 1, out);
    }
}

fn render_body(body: &BodyDef, doc: &SpecDocument) -> String {
    let names: Vec<&str> = match body.schema_name.as_deref().and_then(|n| doc.schema(n)) {
        Some(schema) if !body.type_label.starts_with("array") => {
            schema.properties.iter().map(|p| p.name.as_str()).collect()
        }
        _ => body.properties.iter().map(|p| p.name.as_str()).collect(),
    };
    if names.is_empty() {
        return body.type_label.clone();
    }
    let mut listed: Vec<&str> = names.iter().take(MAX_LISTED_FIELDS).copied().collect();
    if names.len() > MAX_LISTED_FIELDS {
        listed.push("...");
    }
    format!("{} with fields {}", body.type_label, listed.join(", "))
}

fn render_endpoint(op: &Operation, doc: &SpecDocument) -> String {
    let mut text = format!("Endpoint {}", op.signature());
    if let Some(id) = &op.operation_id {
        text.push_str(&format!("\nOperation id: {}", id));
    }
    if let Some(summary) = &op.summary {
        text.push_str(&format!("\nSummary: {}", summary));
    }
    if !op.parameters.is_empty() {
        let params: Vec<String> = op
            .parameters
            .iter()
            .map(|p| {
                format!(
                    "{} ({}, {}{})",
                    p.name,
                    p.location,
                    p.type_label,
                    if p.required { ", required" } else { "" }
                )
            })
            .collect();
        text.push_str(&format!("\nParameters: {}", params.join("; ")));
    }
    if let Some(body) = &op.request_body {
        text.push_str(&format!("\nRequest body: {}", render_body(body, doc)));
    }
    if !op.responses.is_empty() {
        let responses: Vec<String> = op
            .responses
            .iter()
            .map(|r| match (&r.body, &r.description) {
                (Some(body), _) => format!("{} {}", r.status, render_body(body, doc)),
                (None, Some(desc)) => format!("{} {}", r.status, desc),
                (None, None) => r.status.clone(),
            })
            .collect();
        text.push_str(&format!("\nResponses: {}", responses.join("; ")));
    }
    text
}

/// Request-body targets of an endpoint: the referenced schema's fields,
/// or the inline body's fields keyed by operation.
fn endpoint_targets(op: &Operation, doc: &SpecDocument) -> Vec<TargetField> {
    match &op.request_body {
        Some(body) => match body.schema_name.as_deref().and_then(|n| doc.schema(n)) {
            Some(schema) => schema.targets(),
            None => op
                .targets()
                .into_iter()
                .filter(|t| !op.parameters.iter().any(|p| t.path.ends_with(&format!(".{}", p.name))))
                .collect(),
        },
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> SpecDocument {
        SpecDocument::parse(&json!({
            "openapi": "3.0.0",
            "paths": {
                "/absences": {
                    "post": {
                        "operationId": "createAbsence",
                        "parameters": [
                            { "name": "employeeId", "in": "query", "required": true,
                              "schema": { "type": "string" } }
                        ],
                        "requestBody": { "content": { "application/json": {
                            "schema": { "$ref": "#/components/schemas/Absence" } } } },
                        "responses": { "201": { "description": "Created" } }
                    }
                },
                "/notes": {
                    "post": {
                        "requestBody": { "content": { "application/json": {
                            "schema": { "type": "object",
                                "properties": { "body": { "type": "string" } } } } } },
                        "responses": { "204": { "description": "No content" } }
                    }
                }
            },
            "components": { "schemas": {
                "Absence": {
                    "type": "object",
                    "required": ["start_date"],
                    "description": "A period of leave",
                    "properties": {
                        "start_date": { "type": "string", "format": "date", "example": "2024-03-01" },
                        "kind": { "$ref": "#/components/schemas/AbsenceType" }
                    }
                },
                "AbsenceType": { "type": "string", "enum": ["sick", "vacation"] }
            } }
        }))
        .unwrap()
    }

    #[test]
    fn test_chunk_kinds_and_counts() {
        let chunks = chunk_document(&doc());
        let count = |k: ChunkKind| chunks.iter().filter(|c| c.kind == k).count();
        assert_eq!(count(ChunkKind::SchemaSummary), 2);
        // AbsenceType has no properties.
        assert_eq!(count(ChunkKind::SchemaProperties), 1);
        assert_eq!(count(ChunkKind::Endpoint), 2);
        assert_eq!(count(ChunkKind::Parameter), 1);
    }

    #[test]
    fn test_properties_chunk_inlines_references() {
        let chunks = chunk_document(&doc());
        let props = chunks
            .iter()
            .find(|c| c.kind == ChunkKind::SchemaProperties)
            .unwrap();
        assert_eq!(props.structural_path, "Schema.Absence.*");
        assert!(props.text.contains("- start_date: string(date), required"));
        assert!(props.text.contains("Example: \"2024-03-01\""));
        assert!(props.text.contains("enum [sick, vacation]"));
        assert!(!props.text.contains("$ref"));

        let summary = chunks
            .iter()
            .find(|c| c.structural_path == "Schema.Absence")
            .unwrap();
        assert_eq!(props.parent_id.as_deref(), Some(summary.id.as_str()));
        assert!(summary.text.contains("Required: start_date"));
        assert!(summary.text.contains("A period of leave"));
    }

    #[test]
    fn test_endpoint_and_parameter_chunks() {
        let chunks = chunk_document(&doc());
        let endpoint = chunks
            .iter()
            .find(|c| c.structural_path == "POST /absences")
            .unwrap();
        assert_eq!(endpoint.method.as_deref(), Some("POST"));
        assert!(endpoint.text.contains("Operation id: createAbsence"));
        assert!(endpoint.text.contains("Request body: Absence with fields start_date, kind")
            || endpoint.text.contains("Request body: Absence with fields kind, start_date"));
        assert!(endpoint.targets.iter().any(|t| t.path == "Absence.start_date"));

        let param = chunks
            .iter()
            .find(|c| c.kind == ChunkKind::Parameter)
            .unwrap();
        assert_eq!(param.structural_path, "POST /absences#employeeId");
        assert_eq!(param.parent_id.as_deref(), Some(endpoint.id.as_str()));
        assert_eq!(param.targets[0].path, "createAbsence.employeeId");
    }

    #[test]
    fn test_inline_body_targets_keyed_by_operation() {
        let chunks = chunk_document(&doc());
        let notes = chunks
            .iter()
            .find(|c| c.structural_path == "POST /notes")
            .unwrap();
        assert_eq!(notes.targets.len(), 1);
        assert_eq!(notes.targets[0].path, "POST /notes.body");
    }

    #[test]
    fn test_ids_deterministic_and_unique() {
        let a = chunk_document(&doc());
        let b = chunk_document(&doc());
        let ids_a: Vec<&str> = a.iter().map(|c| c.id.as_str()).collect();
        let ids_b: Vec<&str> = b.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids_a, ids_b);

        let mut unique = ids_a.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids_a.len());
    }

    #[test]
    fn test_chunk_id_depends_on_kind_and_path() {
        let a = chunk_id(ChunkKind::Endpoint, "GET /a", "text");
        let b = chunk_id(ChunkKind::Parameter, "GET /a", "text");
        let c = chunk_id(ChunkKind::Endpoint, "GET /b", "text");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
