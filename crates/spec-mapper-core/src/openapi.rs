//! OpenAPI document model.
//!
//! Parses an OpenAPI 2.x (`swagger`) or 3.x (`openapi`) document held as a
//! [`serde_json::Value`] into a flat, fully resolved view: schemas with
//! `allOf` composition flattened, operations with parameters, request
//! bodies and responses, and every local `$ref` followed.
//!
//! Parsing is strict. Anything structurally wrong fails with
//! [`MapError::SpecParse`] naming the dotted location of the offending
//! node, so a collection is never built from half a document.
//!
//! # Reference resolution
//!
//! Only local JSON-pointer references (`#/components/schemas/X`,
//! `#/definitions/X`, `#/components/parameters/X`, ...) are supported.
//! Chained references are followed up to [`MAX_REF_HOPS`]; a schema that
//! reaches itself through `$ref` is cut at the second visit.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{MapError, Result};
use crate::models::TargetField;

/// Maximum number of `$ref` hops followed for one node.
pub const MAX_REF_HOPS: usize = 16;

/// Maximum nesting depth for inline object properties.
const MAX_INLINE_DEPTH: usize = 2;

/// Maximum number of referenced field names inlined into a property.
const MAX_INLINE_FIELDS: usize = 12;

const HTTP_METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "patch", "head", "options", "trace",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecVersion {
    Swagger2,
    OpenApi3,
}

/// A resolved property of a schema or inline body.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    pub name: String,
    pub type_label: String,
    pub format: Option<String>,
    pub enum_values: Vec<String>,
    pub example: Option<Value>,
    pub description: Option<String>,
    pub required: bool,
    /// Name of the referenced schema, when the property is a `$ref`.
    pub ref_name: Option<String>,
    /// Property names of the referenced schema, inlined one level deep.
    pub ref_fields: Vec<String>,
    /// Inline object properties.
    pub children: Vec<PropertyDef>,
}

/// A named schema with `allOf` flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDef {
    pub name: String,
    pub schema_type: String,
    pub description: Option<String>,
    pub required: Vec<String>,
    pub enum_values: Vec<String>,
    pub properties: Vec<PropertyDef>,
}

impl SchemaDef {
    /// All target fields of this schema, nested inline objects included.
    pub fn targets(&self) -> Vec<TargetField> {
        let mut out = Vec::new();
        collect_targets(&self.name, &self.properties, &mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDef {
    pub name: String,
    pub location: String,
    pub type_label: String,
    pub format: Option<String>,
    pub enum_values: Vec<String>,
    pub required: bool,
    pub description: Option<String>,
}

/// The schema carried by a request or response body.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyDef {
    pub schema_name: Option<String>,
    pub type_label: String,
    /// Flattened properties, whether the body is referenced or inline.
    pub properties: Vec<PropertyDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDef {
    pub status: String,
    pub description: Option<String>,
    pub body: Option<BodyDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Upper-case HTTP method.
    pub method: String,
    pub path: String,
    pub operation_id: Option<String>,
    pub summary: Option<String>,
    pub parameters: Vec<ParameterDef>,
    pub request_body: Option<BodyDef>,
    pub responses: Vec<ResponseDef>,
}

impl Operation {
    /// `POST /absences`
    pub fn signature(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    /// Prefix used for parameter and inline-body target paths.
    pub fn key(&self) -> String {
        self.operation_id.clone().unwrap_or_else(|| self.signature())
    }

    /// Parameter and request-body targets contributed by this operation.
    ///
    /// A body that references a named schema contributes nothing here; its
    /// targets belong to the schema.
    pub fn targets(&self) -> Vec<TargetField> {
        let key = self.key();
        let mut out: Vec<TargetField> = self
            .parameters
            .iter()
            .map(|p| TargetField {
                path: format!("{}.{}", key, p.name),
                type_label: p.type_label.clone(),
                format: p.format.clone(),
                enum_values: p.enum_values.clone(),
            })
            .collect();
        if let Some(body) = &self.request_body {
            if body.schema_name.is_none() {
                collect_targets(&key, &body.properties, &mut out);
            }
        }
        out
    }

    pub fn is_write(&self) -> bool {
        matches!(self.method.as_str(), "POST" | "PUT" | "PATCH")
    }
}

/// A parsed, resolved specification document.
#[derive(Debug, Clone)]
pub struct SpecDocument {
    pub version: SpecVersion,
    pub title: Option<String>,
    /// Sorted by name.
    pub schemas: Vec<SchemaDef>,
    /// Sorted by path, then method.
    pub operations: Vec<Operation>,
    pub warnings: Vec<String>,
}

impl SpecDocument {
    /// Parse and resolve a specification document.
    pub fn parse(root: &Value) -> Result<Self> {
        let obj = root
            .as_object()
            .ok_or_else(|| MapError::spec_parse("$", "document root must be an object"))?;

        let version = detect_version(obj)?;
        let title = obj
            .get("info")
            .and_then(|i| i.get("title"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let parser = Parser { root, version };
        let mut warnings = Vec::new();

        let (schemas_at, schemas_value) = match version {
            SpecVersion::OpenApi3 => (
                "components.schemas",
                obj.get("components").and_then(|c| c.get("schemas")),
            ),
            SpecVersion::Swagger2 => ("definitions", obj.get("definitions")),
        };

        let mut schemas = Vec::new();
        match schemas_value {
            Some(Value::Object(map)) => {
                for (name, schema) in map {
                    let at = format!("{}.{}", schemas_at, name);
                    schemas.push(parser.schema_def(name, schema, &at)?);
                }
            }
            Some(_) => return Err(MapError::spec_parse(schemas_at, "expected an object")),
            None => warnings.push(format!("document defines no schemas ({})", schemas_at)),
        }
        schemas.sort_by(|a, b| a.name.cmp(&b.name));

        let mut operations = Vec::new();
        match obj.get("paths") {
            Some(Value::Object(paths)) => {
                for (path, item) in paths {
                    if path.starts_with("x-") {
                        continue;
                    }
                    let at = format!("paths.{}", path);
                    parser.path_item(path, item, &at, &mut operations, &mut warnings)?;
                }
            }
            Some(_) => return Err(MapError::spec_parse("paths", "expected an object")),
            None => warnings.push("document defines no paths".to_string()),
        }
        operations.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then(method_rank(&a.method).cmp(&method_rank(&b.method)))
        });

        Ok(Self {
            version,
            title,
            schemas,
            operations,
            warnings,
        })
    }

    pub fn schema(&self, name: &str) -> Option<&SchemaDef> {
        self.schemas.iter().find(|s| s.name == name)
    }

    /// Every target field in the document, keyed by path.
    pub fn target_index(&self) -> BTreeMap<String, TargetField> {
        let mut index = BTreeMap::new();
        for schema in &self.schemas {
            for t in schema.targets() {
                index.insert(t.path.clone(), t);
            }
        }
        for op in &self.operations {
            for t in op.targets() {
                index.insert(t.path.clone(), t);
            }
        }
        index
    }

    /// Write operations whose request body is the named schema, in
    /// POST, PUT, PATCH order.
    pub fn operations_consuming(&self, schema_name: &str) -> Vec<&Operation> {
        let mut ops: Vec<&Operation> = self
            .operations
            .iter()
            .filter(|op| {
                op.is_write()
                    && op
                        .request_body
                        .as_ref()
                        .and_then(|b| b.schema_name.as_deref())
                        == Some(schema_name)
            })
            .collect();
        ops.sort_by_key(|op| method_rank(&op.method));
        ops
    }

    /// The operation whose key prefixes a parameter or inline-body target.
    pub fn operation_by_key(&self, key: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.key() == key)
    }
}

fn detect_version(obj: &Map<String, Value>) -> Result<SpecVersion> {
    if let Some(v) = obj.get("openapi") {
        let v = v
            .as_str()
            .ok_or_else(|| MapError::spec_parse("openapi", "version must be a string"))?;
        if v.starts_with('3') {
            return Ok(SpecVersion::OpenApi3);
        }
        return Err(MapError::spec_parse(
            "openapi",
            format!("unsupported OpenAPI version '{}'", v),
        ));
    }
    if let Some(v) = obj.get("swagger") {
        let v = v
            .as_str()
            .ok_or_else(|| MapError::spec_parse("swagger", "version must be a string"))?;
        if v.starts_with('2') {
            return Ok(SpecVersion::Swagger2);
        }
        return Err(MapError::spec_parse(
            "swagger",
            format!("unsupported Swagger version '{}'", v),
        ));
    }
    Err(MapError::spec_parse(
        "$",
        "missing 'openapi' or 'swagger' version field",
    ))
}

fn method_rank(method: &str) -> usize {
    match method {
        "POST" => 0,
        "PUT" => 1,
        "PATCH" => 2,
        "GET" => 3,
        "DELETE" => 4,
        _ => 5,
    }
}

fn collect_targets(prefix: &str, props: &[PropertyDef], out: &mut Vec<TargetField>) {
    for p in props {
        let path = format!("{}.{}", prefix, p.name);
        out.push(TargetField {
            path: path.clone(),
            type_label: p.type_label.clone(),
            format: p.format.clone(),
            enum_values: p.enum_values.clone(),
        });
        collect_targets(&path, &p.children, out);
    }
}

/// Intermediate result of flattening a schema node.
#[derive(Default)]
struct Flat {
    schema_type: Option<String>,
    description: Option<String>,
    required: Vec<String>,
    enum_values: Vec<String>,
    format: Option<String>,
    properties: Vec<PropertyDef>,
}

impl Flat {
    fn merge(&mut self, other: Flat) {
        if self.schema_type.is_none() {
            self.schema_type = other.schema_type;
        }
        if self.description.is_none() {
            self.description = other.description;
        }
        if self.format.is_none() {
            self.format = other.format;
        }
        if self.enum_values.is_empty() {
            self.enum_values = other.enum_values;
        }
        for r in other.required {
            if !self.required.contains(&r) {
                self.required.push(r);
            }
        }
        for p in other.properties {
            match self.properties.iter_mut().find(|q| q.name == p.name) {
                Some(existing) => *existing = p,
                None => self.properties.push(p),
            }
        }
    }
}

struct Parser<'a> {
    root: &'a Value,
    version: SpecVersion,
}

impl<'a> Parser<'a> {
    /// Follow `$ref` chains starting at `node`. Returns the resolved node
    /// and the name of the last schema referenced, if any.
    fn deref(&self, node: &'a Value, at: &str) -> Result<(&'a Value, Option<String>)> {
        let mut current = node;
        let mut name = None;
        for _ in 0..MAX_REF_HOPS {
            let reference = match current.get("$ref") {
                Some(r) => r,
                None => return Ok((current, name)),
            };
            let reference = reference
                .as_str()
                .ok_or_else(|| MapError::spec_parse(at, "$ref must be a string"))?;
            let pointer = reference.strip_prefix('#').ok_or_else(|| {
                MapError::spec_parse(
                    at,
                    format!("external reference '{}' is not supported", reference),
                )
            })?;
            current = self.root.pointer(pointer).ok_or_else(|| {
                MapError::spec_parse(at, format!("unresolved reference '{}'", reference))
            })?;
            name = pointer
                .rsplit('/')
                .next()
                .map(|s| s.replace("~1", "/").replace("~0", "~"));
        }
        Err(MapError::spec_parse(
            at,
            format!("reference chain longer than {} hops", MAX_REF_HOPS),
        ))
    }

    fn schema_def(&self, name: &str, schema: &'a Value, at: &str) -> Result<SchemaDef> {
        let mut stack = vec![name.to_string()];
        let flat = self.flatten(schema, at, &mut stack)?;
        let properties = flat
            .properties
            .into_iter()
            .map(|mut p| {
                p.required = flat.required.contains(&p.name);
                p
            })
            .collect::<Vec<_>>();
        let schema_type = flat.schema_type.unwrap_or_else(|| {
            if properties.is_empty() {
                "any".to_string()
            } else {
                "object".to_string()
            }
        });
        Ok(SchemaDef {
            name: name.to_string(),
            schema_type,
            description: flat.description,
            required: flat.required,
            enum_values: flat.enum_values,
            properties,
        })
    }

    fn flatten(&self, schema: &'a Value, at: &str, stack: &mut Vec<String>) -> Result<Flat> {
        if !schema.is_object() {
            return Err(MapError::spec_parse(at, "schema must be an object"));
        }

        if schema.get("$ref").is_some() {
            let (target, ref_name) = self.deref(schema, at)?;
            if let Some(ref_name) = &ref_name {
                if stack.contains(ref_name) {
                    return Ok(Flat {
                        schema_type: Some("object".to_string()),
                        ..Flat::default()
                    });
                }
                stack.push(ref_name.clone());
            }
            let flat = self.flatten(target, at, stack);
            if ref_name.is_some() {
                stack.pop();
            }
            return flat;
        }

        let mut flat = Flat::default();

        if let Some(all_of) = schema.get("allOf") {
            let members = all_of
                .as_array()
                .ok_or_else(|| MapError::spec_parse(format!("{}.allOf", at), "expected an array"))?;
            for (i, member) in members.iter().enumerate() {
                let member_at = format!("{}.allOf[{}]", at, i);
                let inner = self.flatten(member, &member_at, stack)?;
                flat.merge(inner);
            }
        }

        let own = self.own_facts(schema, at, stack)?;
        flat.merge_own(own);
        Ok(flat)
    }

    fn own_facts(&self, schema: &'a Value, at: &str, stack: &mut Vec<String>) -> Result<Flat> {
        let mut own = Flat {
            schema_type: type_name(schema),
            description: str_field(schema, "description"),
            format: str_field(schema, "format"),
            enum_values: enum_values(schema),
            ..Flat::default()
        };

        if let Some(required) = schema.get("required") {
            let list = required.as_array().ok_or_else(|| {
                MapError::spec_parse(format!("{}.required", at), "expected an array of strings")
            })?;
            for r in list {
                let r = r.as_str().ok_or_else(|| {
                    MapError::spec_parse(format!("{}.required", at), "expected an array of strings")
                })?;
                own.required.push(r.to_string());
            }
        }

        if let Some(props) = schema.get("properties") {
            let props = props.as_object().ok_or_else(|| {
                MapError::spec_parse(format!("{}.properties", at), "expected an object")
            })?;
            for (name, prop) in props {
                let prop_at = format!("{}.properties.{}", at, name);
                let required = own.required.contains(name);
                own.properties
                    .push(self.property(name, prop, &prop_at, required, 0, stack)?);
            }
            if own.schema_type.is_none() {
                own.schema_type = Some("object".to_string());
            }
        }
        Ok(own)
    }

    fn property(
        &self,
        name: &str,
        prop: &'a Value,
        at: &str,
        required: bool,
        depth: usize,
        stack: &mut Vec<String>,
    ) -> Result<PropertyDef> {
        if !prop.is_object() {
            return Err(MapError::spec_parse(at, "property must be an object"));
        }

        let mut def = PropertyDef {
            name: name.to_string(),
            type_label: "any".to_string(),
            format: str_field(prop, "format"),
            enum_values: enum_values(prop),
            example: example(prop),
            description: str_field(prop, "description"),
            required,
            ref_name: None,
            ref_fields: Vec::new(),
            children: Vec::new(),
        };

        if prop.get("$ref").is_some() {
            let (target, ref_name) = self.deref(prop, at)?;
            let ref_name = ref_name.unwrap_or_else(|| name.to_string());
            if stack.contains(&ref_name) {
                def.type_label = format!("object ({})", ref_name);
                def.ref_name = Some(ref_name);
                return Ok(def);
            }
            stack.push(ref_name.clone());
            let flat = self.flatten(target, at, stack);
            stack.pop();
            let flat = flat?;
            let base = flat.schema_type.clone().unwrap_or_else(|| "object".to_string());
            if flat.properties.is_empty() {
                def.type_label = format!("{} ({})", base, ref_name);
            } else {
                def.type_label = format!("object ({})", ref_name);
                def.ref_fields = flat
                    .properties
                    .iter()
                    .take(MAX_INLINE_FIELDS)
                    .map(|p| p.name.clone())
                    .collect();
            }
            if def.enum_values.is_empty() {
                def.enum_values = flat.enum_values;
            }
            if def.format.is_none() {
                def.format = flat.format;
            }
            if def.description.is_none() {
                def.description = flat.description;
            }
            def.ref_name = Some(ref_name);
            return Ok(def);
        }

        if prop.get("allOf").is_some() {
            let flat = self.flatten(prop, at, stack)?;
            def.type_label = flat.schema_type.unwrap_or_else(|| "object".to_string());
            def.ref_fields = flat
                .properties
                .iter()
                .take(MAX_INLINE_FIELDS)
                .map(|p| p.name.clone())
                .collect();
            if def.enum_values.is_empty() {
                def.enum_values = flat.enum_values;
            }
            return Ok(def);
        }

        let ty = type_name(prop).unwrap_or_else(|| {
            if prop.get("properties").is_some() {
                "object".to_string()
            } else {
                "any".to_string()
            }
        });

        def.type_label = match ty.as_str() {
            "array" => {
                let items_at = format!("{}.items", at);
                match prop.get("items") {
                    Some(items) => format!("array of {}", self.item_label(items, &items_at)?),
                    None => "array".to_string(),
                }
            }
            other => match &def.format {
                Some(f) if other != "object" => format!("{}({})", other, f),
                _ => other.to_string(),
            },
        };

        if ty == "object" && depth < MAX_INLINE_DEPTH {
            if let Some(children) = prop.get("properties") {
                let children = children.as_object().ok_or_else(|| {
                    MapError::spec_parse(format!("{}.properties", at), "expected an object")
                })?;
                let child_required: Vec<String> = prop
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                for (child_name, child) in children {
                    let child_at = format!("{}.properties.{}", at, child_name);
                    let req = child_required.contains(child_name);
                    def.children.push(self.property(
                        child_name,
                        child,
                        &child_at,
                        req,
                        depth + 1,
                        stack,
                    )?);
                }
            }
        }

        Ok(def)
    }

    fn item_label(&self, items: &'a Value, at: &str) -> Result<String> {
        if items.get("$ref").is_some() {
            let (_, ref_name) = self.deref(items, at)?;
            return Ok(ref_name.unwrap_or_else(|| "object".to_string()));
        }
        if !items.is_object() {
            return Err(MapError::spec_parse(at, "items must be an object"));
        }
        Ok(type_name(items).unwrap_or_else(|| "any".to_string()))
    }

    fn path_item(
        &self,
        path: &str,
        item: &'a Value,
        at: &str,
        operations: &mut Vec<Operation>,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let (item, _) = self.deref(item, at)?;
        let item = item
            .as_object()
            .ok_or_else(|| MapError::spec_parse(at, "path item must be an object"))?;

        let shared = match item.get("parameters") {
            Some(p) => self.parameters(p, &format!("{}.parameters", at))?,
            None => ParsedParams::default(),
        };

        for method in HTTP_METHODS {
            let op = match item.get(method) {
                Some(op) => op,
                None => continue,
            };
            let op_at = format!("{}.{}", at, method);
            let op_obj = op
                .as_object()
                .ok_or_else(|| MapError::spec_parse(&op_at, "operation must be an object"))?;

            let mut params = match op_obj.get("parameters") {
                Some(p) => self.parameters(p, &format!("{}.parameters", op_at))?,
                None => ParsedParams::default(),
            };
            for sp in &shared.params {
                if !params
                    .params
                    .iter()
                    .any(|p| p.name == sp.name && p.location == sp.location)
                {
                    params.params.push(sp.clone());
                }
            }
            let mut request_body = params.body.or_else(|| shared.body.clone());

            if self.version == SpecVersion::OpenApi3 {
                if let Some(rb) = op_obj.get("requestBody") {
                    request_body = self.request_body(rb, &format!("{}.requestBody", op_at))?;
                }
            }

            let responses = match op_obj.get("responses") {
                Some(r) => self.responses(r, &format!("{}.responses", op_at))?,
                None => {
                    warnings.push(format!("{} has no responses", op_at));
                    Vec::new()
                }
            };

            operations.push(Operation {
                method: method.to_ascii_uppercase(),
                path: path.to_string(),
                operation_id: str_field(op, "operationId"),
                summary: str_field(op, "summary").or_else(|| str_field(op, "description")),
                parameters: params.params,
                request_body,
                responses,
            });
        }
        Ok(())
    }

    fn parameters(&self, list: &'a Value, at: &str) -> Result<ParsedParams> {
        let list = list
            .as_array()
            .ok_or_else(|| MapError::spec_parse(at, "expected an array"))?;
        let mut parsed = ParsedParams::default();
        for (i, raw) in list.iter().enumerate() {
            let p_at = format!("{}[{}]", at, i);
            let (param, _) = self.deref(raw, &p_at)?;
            let name = param
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| MapError::spec_parse(&p_at, "parameter requires a string 'name'"))?;
            let location = param
                .get("in")
                .and_then(Value::as_str)
                .ok_or_else(|| MapError::spec_parse(&p_at, "parameter requires a string 'in'"))?;

            if location == "body" {
                // Swagger 2 carries the request body as a parameter.
                if let Some(schema) = param.get("schema") {
                    parsed.body = Some(self.body(schema, &format!("{}.schema", p_at))?);
                }
                continue;
            }

            // OpenAPI 3 nests the type under `schema`; Swagger 2 inlines it.
            let typed = param.get("schema").unwrap_or(param);
            let (typed, ref_name) = self.deref(typed, &p_at)?;
            let format = str_field(typed, "format");
            let base = type_name(typed)
                .or(ref_name)
                .unwrap_or_else(|| "string".to_string());
            let type_label = match &format {
                Some(f) => format!("{}({})", base, f),
                None => base,
            };
            parsed.params.push(ParameterDef {
                name: name.to_string(),
                location: location.to_string(),
                type_label,
                format,
                enum_values: enum_values(typed),
                required: param
                    .get("required")
                    .and_then(Value::as_bool)
                    .unwrap_or(location == "path"),
                description: str_field(param, "description"),
            });
        }
        Ok(parsed)
    }

    fn request_body(&self, rb: &'a Value, at: &str) -> Result<Option<BodyDef>> {
        let (rb, _) = self.deref(rb, at)?;
        match rb.get("content") {
            Some(content) => self.content_schema(content, &format!("{}.content", at)),
            None => Ok(None),
        }
    }

    /// Pick the JSON media type, or the first one that carries a schema.
    fn content_schema(&self, content: &'a Value, at: &str) -> Result<Option<BodyDef>> {
        let content = content
            .as_object()
            .ok_or_else(|| MapError::spec_parse(at, "expected an object"))?;
        let chosen = content
            .get("application/json")
            .filter(|m| m.get("schema").is_some())
            .map(|m| ("application/json", m))
            .or_else(|| {
                content
                    .iter()
                    .find(|(_, m)| m.get("schema").is_some())
                    .map(|(k, m)| (k.as_str(), m))
            });
        match chosen {
            Some((media, m)) => {
                let schema_at = format!("{}.{}.schema", at, media);
                // `chosen` is filtered on the presence of `schema`.
                match m.get("schema") {
                    Some(schema) => Ok(Some(self.body(schema, &schema_at)?)),
                    None => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    fn body(&self, schema: &'a Value, at: &str) -> Result<BodyDef> {
        if !schema.is_object() {
            return Err(MapError::spec_parse(at, "schema must be an object"));
        }
        if schema.get("$ref").is_some() {
            let (target, ref_name) = self.deref(schema, at)?;
            let mut stack: Vec<String> = ref_name.iter().cloned().collect();
            let flat = self.flatten(target, at, &mut stack)?;
            return Ok(BodyDef {
                type_label: ref_name.clone().unwrap_or_else(|| "object".to_string()),
                schema_name: ref_name,
                properties: flat.properties,
            });
        }
        if type_name(schema).as_deref() == Some("array") {
            let items_at = format!("{}.items", at);
            let label = match schema.get("items") {
                Some(items) => format!("array of {}", self.item_label(items, &items_at)?),
                None => "array".to_string(),
            };
            let schema_name = match schema.get("items") {
                Some(items) if items.get("$ref").is_some() => self.deref(items, &items_at)?.1,
                _ => None,
            };
            return Ok(BodyDef {
                schema_name,
                type_label: label,
                properties: Vec::new(),
            });
        }
        let mut stack = Vec::new();
        let flat = self.flatten(schema, at, &mut stack)?;
        Ok(BodyDef {
            schema_name: None,
            type_label: flat.schema_type.unwrap_or_else(|| "object".to_string()),
            properties: flat.properties,
        })
    }

    fn responses(&self, responses: &'a Value, at: &str) -> Result<Vec<ResponseDef>> {
        let responses = responses
            .as_object()
            .ok_or_else(|| MapError::spec_parse(at, "expected an object"))?;
        let mut out = Vec::new();
        for (status, raw) in responses {
            if status.starts_with("x-") {
                continue;
            }
            let r_at = format!("{}.{}", at, status);
            let (resp, _) = self.deref(raw, &r_at)?;
            if !resp.is_object() {
                return Err(MapError::spec_parse(&r_at, "response must be an object"));
            }
            let body = match self.version {
                SpecVersion::OpenApi3 => match resp.get("content") {
                    Some(content) => self.content_schema(content, &format!("{}.content", r_at))?,
                    None => None,
                },
                SpecVersion::Swagger2 => match resp.get("schema") {
                    Some(schema) => Some(self.body(schema, &format!("{}.schema", r_at))?),
                    None => None,
                },
            };
            out.push(ResponseDef {
                status: status.clone(),
                description: str_field(resp, "description"),
                body,
            });
        }
        Ok(out)
    }
}

impl Flat {
    /// Own facts of a schema override anything inherited through `allOf`.
    fn merge_own(&mut self, own: Flat) {
        if own.schema_type.is_some() {
            self.schema_type = own.schema_type;
        }
        if own.description.is_some() {
            self.description = own.description;
        }
        if own.format.is_some() {
            self.format = own.format;
        }
        if !own.enum_values.is_empty() {
            self.enum_values = own.enum_values;
        }
        let rest = Flat {
            required: own.required,
            properties: own.properties,
            ..Flat::default()
        };
        self.merge(rest);
    }
}

#[derive(Default)]
struct ParsedParams {
    params: Vec<ParameterDef>,
    body: Option<BodyDef>,
}

fn type_name(node: &Value) -> Option<String> {
    match node.get("type") {
        Some(Value::String(s)) => Some(s.clone()),
        // OpenAPI 3.1 allows `type: ["string", "null"]`.
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .map(str::to_string),
        _ => None,
    }
}

fn str_field(node: &Value, key: &str) -> Option<String> {
    node.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn enum_values(node: &Value) -> Vec<String> {
    node.get("enum")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn example(node: &Value) -> Option<Value> {
    node.get("example").cloned().or_else(|| {
        node.get("examples")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .cloned()
    })
}
