//! Live-endpoint validation.
//!
//! [`HttpValidator`] exercises a running instance of the target API (usually a
//! sandbox tenant). For a candidate `Schema.property` it picks a write
//! operation whose request body is that schema, synthesizes a body holding
//! the sample value plus placeholders for the other required properties,
//! sends it and scores the status code:
//!
//! | Status | Score |
//! |--------|-------|
//! | 2xx | 0.9 |
//! | 400, 422 | 0.35 |
//! | 401, 403 | 0.2 |
//! | 404, 405, other 4xx | 0.1 |
//! | 429, 5xx, network | `ValidatorUnavailable` (retried by the agent) |
//!
//! Candidates no write operation declares, including properties the
//! schema does not have, are checked offline with the [`SpecValidator`].

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use spec_mapper_core::error::{MapError, Result};
use spec_mapper_core::openapi::{Operation, PropertyDef, SpecDocument};
use spec_mapper_core::validator::{SpecValidator, Validation, Validator};

use crate::config::ValidatorConfig;

pub struct HttpValidator {
    client: reqwest::Client,
    base_url: String,
    headers: BTreeMap<String, String>,
    doc: Arc<SpecDocument>,
    offline: SpecValidator,
}

impl HttpValidator {
    pub fn new(config: &ValidatorConfig, doc: Arc<SpecDocument>) -> anyhow::Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("validator.base_url required for http validation"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: config.headers.clone(),
            offline: SpecValidator::new(&doc),
            doc,
        })
    }

    /// The operation to call and the body to send for a candidate.
    fn plan(&self, candidate_path: &str, sample: &Value) -> Option<(&Operation, Value)> {
        let (owner, property) = candidate_path.split_once('.')?;
        let head = property.split('.').next().unwrap_or(property);

        if let Some(schema) = self.doc.schema(owner) {
            // An API that ignores unknown fields would accept anything.
            if !schema.properties.iter().any(|p| p.name == head) {
                return None;
            }
            let op = self.doc.operations_consuming(&schema.name).into_iter().next()?;
            let mut body = Map::new();
            for prop in schema.properties.iter().filter(|p| p.required) {
                body.insert(prop.name.clone(), placeholder(prop));
            }
            insert_path(&mut body, property, sample.clone());
            return Some((op, Value::Object(body)));
        }

        // Parameter or inline-body target of an operation.
        let op = self.doc.operation_by_key(owner)?;
        if !op.is_write() {
            return None;
        }
        let in_body = op
            .request_body
            .as_ref()
            .is_some_and(|r| r.properties.iter().any(|p| p.name == head));
        if !in_body && !op.parameters.iter().any(|p| p.name == property) {
            return None;
        }
        let mut body = Map::new();
        if let Some(request) = &op.request_body {
            for prop in request.properties.iter().filter(|p| p.required) {
                body.insert(prop.name.clone(), placeholder(prop));
            }
        }
        if in_body {
            insert_path(&mut body, property, sample.clone());
        }
        Some((op, Value::Object(body)))
    }

    async fn send(&self, op: &Operation, candidate_path: &str, sample: &Value, body: &Value) -> Result<Validation> {
        let property = candidate_path
            .split_once('.')
            .map(|(_, p)| p)
            .unwrap_or(candidate_path);
        let path = fill_path(&op.path, property, sample);
        let url = format!("{}{}", self.base_url, path);
        let method = reqwest::Method::from_bytes(op.method.as_bytes())
            .map_err(|e| MapError::InvalidRequest(format!("bad method {}: {}", op.method, e)))?;

        let mut request = self.client.request(method, &url).json(body);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        for param in op.parameters.iter().filter(|p| p.location == "query") {
            if param.name == property {
                request = request.query(&[(param.name.as_str(), render(sample))]);
            }
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                MapError::Timeout {
                    operation: format!("validate {}", op.signature()),
                }
            } else {
                MapError::ValidatorUnavailable(format!("{}: {}", url, e))
            }
        })?;

        let status = response.status();
        let code = status.as_u16();
        debug!(url = %url, status = code, candidate = candidate_path, "validation request answered");
        if code == 429 || status.is_server_error() {
            return Err(MapError::ValidatorUnavailable(format!(
                "{} returned {}",
                op.signature(),
                status
            )));
        }
        let (score, verdict) = match code {
            200..=299 => (0.9, "accepted"),
            400 | 422 => (0.35, "rejected the payload"),
            401 | 403 => (0.2, "refused authorization"),
            404 | 405 => (0.1, "has no such route"),
            _ => (0.1, "failed"),
        };
        Ok(Validation::new(
            score,
            format!("{} {} ({}) for {}", op.signature(), verdict, code, candidate_path),
        ))
    }
}

#[async_trait]
impl Validator for HttpValidator {
    fn name(&self) -> &str {
        "http"
    }

    async fn validate(&self, candidate_path: &str, sample: Option<&Value>) -> Result<Validation> {
        let sample = sample.cloned().unwrap_or(Value::Null);
        match self.plan(candidate_path, &sample) {
            Some((op, body)) => self.send(op, candidate_path, &sample, &body).await,
            None => {
                let offline = self.offline.check(candidate_path, Some(&sample));
                Ok(Validation::new(
                    offline.score,
                    format!("{} (no write operation declares it; checked offline)", offline.detail),
                ))
            }
        }
    }
}

/// Value accepted by most validators for a property of this type.
fn placeholder(prop: &PropertyDef) -> Value {
    if let Some(example) = &prop.example {
        return example.clone();
    }
    if let Some(first) = prop.enum_values.first() {
        return Value::from(first.clone());
    }
    match prop.format.as_deref() {
        Some("date") => return Value::from("2024-01-15"),
        Some("date-time") => return Value::from("2024-01-15T09:00:00Z"),
        Some("uuid") => return Value::from("3fa85f64-5717-4562-b3fc-2c963f66afa6"),
        Some("email") => return Value::from("jane.doe@example.com"),
        _ => {}
    }
    match spec_mapper_core::validator::base_type(&prop.type_label) {
        "integer" => Value::from(1),
        "number" => Value::from(1.0),
        "boolean" => Value::from(false),
        "array" => Value::Array(Vec::new()),
        "object" => Value::Object(Map::new()),
        _ => Value::from("sample"),
    }
}

/// Set a dotted property path inside a JSON object, creating parents.
fn insert_path(body: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            body.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = body
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "sample".to_string(),
        other => other.to_string(),
    }
}

/// Substitute `{param}` segments. The candidate's own parameter gets the
/// sample value; the rest get `1`.
fn fill_path(template: &str, property: &str, sample: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        match rest[start..].find('}') {
            Some(len) => {
                let name = &rest[start + 1..start + len];
                if name == property {
                    out.push_str(&render(sample));
                } else {
                    out.push('1');
                }
                rest = &rest[start + len + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
