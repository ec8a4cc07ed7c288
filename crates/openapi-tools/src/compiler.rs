//! OpenAPI → operation compiler.
//!
//! Walks the paths/operations of a parsed document and emits one
//! [`Operation`] per defined (path, method) pair, in document order with a
//! fixed method order, so the output is stable across compilations of the
//! same spec.

use openapiv3::{
    Components, OpenAPI, Operation as ApiOperation, Parameter as ApiParameter, ParameterData,
    ParameterSchemaOrContent, PathItem, ReferenceOr, RequestBody, Schema, SchemaKind, Type,
};
use rmcp::model::Tool;
use serde_json::{json, Map, Value};
use specgate_core::RouteInfo;
use std::collections::HashSet;
use std::sync::Arc;

/// The HTTP methods an OpenAPI path item may define, in compilation order.
const METHODS: [&str; 8] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "TRACE"];

/// Where a parameter is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
}

impl ParamLocation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Cookie => "cookie",
        }
    }
}

/// The OpenAPI scalar set, used to validate values at binding time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalarType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Array,
    /// Free-form object; retained solely for request bodies.
    Object,
}

impl ScalarType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Whether a JSON value matches this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    fn from_schema(schema: &Schema) -> Self {
        match &schema.schema_kind {
            SchemaKind::Type(Type::String(_)) => Self::String,
            SchemaKind::Type(Type::Number(_)) => Self::Number,
            SchemaKind::Type(Type::Integer(_)) => Self::Integer,
            SchemaKind::Type(Type::Boolean(_)) => Self::Boolean,
            SchemaKind::Type(Type::Array(_)) => Self::Array,
            SchemaKind::Type(Type::Object(_)) => Self::Object,
            _ => Self::String,
        }
    }
}

/// One compiled operation parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub scalar: ScalarType,
    pub default: Option<Value>,
    /// Allowed values when the schema declares an enumeration.
    pub allowed: Vec<Value>,
    pub description: Option<String>,
}

/// The operation's request body, when it has one.
#[derive(Debug, Clone)]
pub struct BodyDescriptor {
    pub required: bool,
    pub content_type: String,
    pub schema: Option<Value>,
    pub description: Option<String>,
}

/// The MCP-facing schema derived from an operation.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the tool arguments.
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Materialize an MCP tool definition.
    #[must_use]
    pub fn to_tool(&self) -> Tool {
        let schema_obj = self
            .input_schema
            .as_object()
            .cloned()
            .unwrap_or_else(Map::new);
        Tool::new(self.name.clone(), self.description.clone(), Arc::new(schema_obj))
    }
}

/// One callable action compiled from a (path, method) pair.
#[derive(Debug, Clone)]
pub struct Operation {
    pub operation_id: String,
    /// Upstream HTTP method, uppercase.
    pub method: String,
    /// Path template with `{name}` placeholders.
    pub path: String,
    /// Path-level parameters first, then operation-level, deduplicated by
    /// (location, name) with the operation-level entry winning.
    pub parameters: Vec<Parameter>,
    pub body: Option<BodyDescriptor>,
    pub tool: ToolDescriptor,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub deprecated: bool,
}

impl Operation {
    /// Names of parameters the caller must provide (plus `body` when the
    /// request body is required).
    #[must_use]
    pub fn required_parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.clone())
            .collect();
        if self.body.as_ref().is_some_and(|b| b.required) {
            names.push("body".to_string());
        }
        names
    }

    /// Parameter names substituted into the path template.
    #[must_use]
    pub fn path_parameter_names(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.location == ParamLocation::Path)
            .map(|p| p.name.as_str())
            .collect()
    }
}

/// Compile a parsed document into its ordered operation list.
#[must_use]
pub fn compile(spec: &OpenAPI) -> Vec<Operation> {
    let components = spec.components.as_ref();
    let mut operations = Vec::new();
    let mut ids: HashSet<String> = HashSet::new();

    for (path, item) in &spec.paths.paths {
        let item = match item {
            ReferenceOr::Item(item) => item,
            ReferenceOr::Reference { reference } => {
                tracing::warn!(path = %path, reference = %reference, "skipping referenced path item");
                continue;
            }
        };

        for method in METHODS {
            let Some(op) = method_operation(item, method) else {
                continue;
            };
            operations.push(compile_operation(components, path, method, item, op, &mut ids));
        }
    }

    operations
}

/// Route summaries for the control surface.
#[must_use]
pub fn routes(service_name: &str, operations: &[Operation]) -> Vec<RouteInfo> {
    operations
        .iter()
        .map(|op| RouteInfo {
            path: op.path.clone(),
            method: op.method.clone(),
            service_name: service_name.to_string(),
            operation_id: Some(op.operation_id.clone()),
            summary: op.summary.clone(),
            tags: op.tags.clone(),
        })
        .collect()
}

fn method_operation<'a>(item: &'a PathItem, method: &str) -> Option<&'a ApiOperation> {
    match method {
        "GET" => item.get.as_ref(),
        "POST" => item.post.as_ref(),
        "PUT" => item.put.as_ref(),
        "DELETE" => item.delete.as_ref(),
        "PATCH" => item.patch.as_ref(),
        "HEAD" => item.head.as_ref(),
        "OPTIONS" => item.options.as_ref(),
        "TRACE" => item.trace.as_ref(),
        _ => None,
    }
}

fn compile_operation(
    components: Option<&Components>,
    path: &str,
    method: &str,
    item: &PathItem,
    op: &ApiOperation,
    ids: &mut HashSet<String>,
) -> Operation {
    let base_id = op
        .operation_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| synthesize_operation_id(method, path));
    let operation_id = reserve_unique_id(ids, base_id);

    let parameters = merge_parameters(components, &item.parameters, &op.parameters, method, path);
    check_path_placeholders(path, method, &parameters);

    let body = op
        .request_body
        .as_ref()
        .and_then(|body_ref| resolve_request_body(components, body_ref))
        .map(|body| compile_body(components, &body));

    let description = op
        .summary
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| op.description.clone().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| format!("{method} {path}"));

    let tool = ToolDescriptor {
        name: operation_id.clone(),
        description,
        input_schema: build_input_schema(&parameters, body.as_ref()),
    };

    Operation {
        operation_id,
        method: method.to_string(),
        path: path.to_string(),
        parameters,
        body,
        tool,
        summary: op.summary.clone(),
        tags: op.tags.clone(),
        deprecated: op.deprecated,
    }
}

/// Generate an operation id from method and path segments:
/// `GET /pets/{petId}/owners` → `getPetsPetIdOwners`.
fn synthesize_operation_id(method: &str, path: &str) -> String {
    let mut id = method.to_lowercase();
    for (i, segment) in path.split('/').filter(|s| !s.is_empty()).enumerate() {
        let clean = segment.trim_matches(|c| c == '{' || c == '}');
        if clean.is_empty() {
            continue;
        }
        if i == 0 {
            id.push_str(&capitalize_first(&clean.to_lowercase()));
        } else {
            id.push_str(&capitalize_first(clean));
        }
    }
    id
}

fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn reserve_unique_id(ids: &mut HashSet<String>, base: String) -> String {
    if ids.insert(base.clone()) {
        return base;
    }
    let mut counter = 1;
    loop {
        let candidate = format!("{base}_{counter}");
        if ids.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

/// Path-level parameters first (preserving spec order), then operation-level;
/// duplicates keyed by (location, name) keep the operation-level entry.
fn merge_parameters(
    components: Option<&Components>,
    path_level: &[ReferenceOr<ApiParameter>],
    op_level: &[ReferenceOr<ApiParameter>],
    method: &str,
    path: &str,
) -> Vec<Parameter> {
    let mut merged: Vec<Parameter> = Vec::new();

    for param_ref in path_level.iter().chain(op_level) {
        let Some(api_param) = resolve_parameter(components, param_ref) else {
            tracing::warn!(method, path, "skipping unresolvable parameter reference");
            continue;
        };
        let param = compile_parameter(components, &api_param);
        match merged
            .iter()
            .position(|p| p.location == param.location && p.name == param.name)
        {
            Some(i) => merged[i] = param,
            None => merged.push(param),
        }
    }

    merged
}

fn compile_parameter(components: Option<&Components>, param: &ApiParameter) -> Parameter {
    let (location, data) = match param {
        ApiParameter::Path { parameter_data, .. } => (ParamLocation::Path, parameter_data),
        ApiParameter::Query { parameter_data, .. } => (ParamLocation::Query, parameter_data),
        ApiParameter::Header { parameter_data, .. } => (ParamLocation::Header, parameter_data),
        ApiParameter::Cookie { parameter_data, .. } => (ParamLocation::Cookie, parameter_data),
    };

    // Path parameters are always required regardless of the spec flag.
    let required = location == ParamLocation::Path || data.required;

    let schema = parameter_schema(components, data);
    let (scalar, default, allowed) = match schema {
        Some(schema) => (
            ScalarType::from_schema(&schema),
            schema.schema_data.default.clone(),
            schema_enumeration(&schema),
        ),
        None => (ScalarType::String, None, Vec::new()),
    };

    Parameter {
        name: data.name.clone(),
        location,
        required,
        scalar,
        default,
        allowed,
        description: data.description.clone(),
    }
}

fn parameter_schema(components: Option<&Components>, data: &ParameterData) -> Option<Schema> {
    match &data.format {
        ParameterSchemaOrContent::Schema(schema_ref) => resolve_schema(components, schema_ref),
        // `content`-style parameters are treated as opaque strings.
        ParameterSchemaOrContent::Content(_) => None,
    }
}

fn schema_enumeration(schema: &Schema) -> Vec<Value> {
    match &schema.schema_kind {
        SchemaKind::Type(Type::String(s)) => {
            s.enumeration.iter().flatten().map(|v| Value::String(v.clone())).collect()
        }
        SchemaKind::Type(Type::Integer(i)) => {
            i.enumeration.iter().flatten().map(|v| json!(v)).collect()
        }
        SchemaKind::Type(Type::Number(n)) => {
            n.enumeration.iter().flatten().map(|v| json!(v)).collect()
        }
        _ => Vec::new(),
    }
}

/// Body media-type preference: JSON, then form-urlencoded, then text/plain,
/// then whatever the spec lists first.
const BODY_CONTENT_TYPES: [&str; 3] =
    ["application/json", "application/x-www-form-urlencoded", "text/plain"];

fn compile_body(components: Option<&Components>, body: &RequestBody) -> BodyDescriptor {
    let selected = BODY_CONTENT_TYPES
        .iter()
        .find_map(|ct| body.content.get(*ct).map(|media| (ct.to_string(), media)))
        .or_else(|| body.content.iter().next().map(|(ct, media)| (ct.clone(), media)));

    let (content_type, schema) = match selected {
        Some((ct, media)) => {
            let schema = media
                .schema
                .as_ref()
                .map(|schema_ref| match resolve_schema(components, schema_ref) {
                    Some(schema) => schema_to_json(&schema),
                    None => reference_json(schema_ref),
                });
            (ct, schema)
        }
        None => ("application/json".to_string(), None),
    };

    BodyDescriptor {
        required: body.required,
        content_type,
        schema,
        description: body.description.clone(),
    }
}

fn check_path_placeholders(path: &str, method: &str, parameters: &[Parameter]) {
    let placeholders: HashSet<&str> = path
        .split('/')
        .filter(|s| s.starts_with('{') && s.ends_with('}'))
        .map(|s| s.trim_matches(|c| c == '{' || c == '}'))
        .collect();
    let declared: HashSet<&str> = parameters
        .iter()
        .filter(|p| p.location == ParamLocation::Path)
        .map(|p| p.name.as_str())
        .collect();

    if placeholders != declared {
        tracing::warn!(
            method,
            path,
            "path template placeholders do not match declared path parameters"
        );
    }
}

/// One property per parameter plus a synthetic `body` property when a request
/// body exists; the required list holds every required parameter and `body`
/// if the body is required.
fn build_input_schema(parameters: &[Parameter], body: Option<&BodyDescriptor>) -> Value {
    let mut properties = Map::new();
    let mut required: Vec<String> = Vec::new();

    for param in parameters {
        let mut prop = Map::new();
        prop.insert("type".to_string(), json!(param.scalar.as_str()));
        if let Some(description) = &param.description {
            prop.insert("description".to_string(), json!(description));
        }
        if let Some(default) = &param.default {
            prop.insert("default".to_string(), default.clone());
        }
        if !param.allowed.is_empty() {
            prop.insert("enum".to_string(), Value::Array(param.allowed.clone()));
        }
        properties.insert(param.name.clone(), Value::Object(prop));

        if param.required {
            required.push(param.name.clone());
        }
    }

    if let Some(body) = body {
        let mut prop = Map::new();
        prop.insert("type".to_string(), json!("object"));
        if let Some(description) = &body.description {
            prop.insert("description".to_string(), json!(description));
        }
        prop.insert("contentType".to_string(), json!(body.content_type));
        properties.insert("body".to_string(), Value::Object(prop));

        if body.required {
            required.push("body".to_string());
        }
    }

    let mut schema = Map::new();
    schema.insert("type".to_string(), json!("object"));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_string(), json!(required));
    }

    Value::Object(schema)
}

// --- internal reference resolution -----------------------------------------
//
// External references are rejected at fetch time, so only `#/components/*`
// references reach the compiler. One level of indirection is resolved;
// reference-to-reference chains are treated as unresolvable.

fn component_name<'a>(reference: &'a str, section: &str) -> Option<&'a str> {
    reference.strip_prefix("#/components/")?.strip_prefix(section)?.strip_prefix('/')
}

fn resolve_parameter(
    components: Option<&Components>,
    param_ref: &ReferenceOr<ApiParameter>,
) -> Option<ApiParameter> {
    match param_ref {
        ReferenceOr::Item(param) => Some(param.clone()),
        ReferenceOr::Reference { reference } => {
            let name = component_name(reference, "parameters")?;
            match components?.parameters.get(name)? {
                ReferenceOr::Item(param) => Some(param.clone()),
                ReferenceOr::Reference { .. } => None,
            }
        }
    }
}

fn resolve_request_body(
    components: Option<&Components>,
    body_ref: &ReferenceOr<RequestBody>,
) -> Option<RequestBody> {
    match body_ref {
        ReferenceOr::Item(body) => Some(body.clone()),
        ReferenceOr::Reference { reference } => {
            let name = component_name(reference, "requestBodies")?;
            match components?.request_bodies.get(name)? {
                ReferenceOr::Item(body) => Some(body.clone()),
                ReferenceOr::Reference { .. } => None,
            }
        }
    }
}

fn resolve_schema(
    components: Option<&Components>,
    schema_ref: &ReferenceOr<Schema>,
) -> Option<Schema> {
    match schema_ref {
        ReferenceOr::Item(schema) => Some(schema.clone()),
        ReferenceOr::Reference { reference } => {
            let name = component_name(reference, "schemas")?;
            match components?.schemas.get(name)? {
                ReferenceOr::Item(schema) => Some(schema.clone()),
                ReferenceOr::Reference { .. } => None,
            }
        }
    }
}

fn reference_json(schema_ref: &ReferenceOr<Schema>) -> Value {
    match schema_ref {
        ReferenceOr::Item(schema) => schema_to_json(schema),
        ReferenceOr::Reference { reference } => json!({ "$ref": reference }),
    }
}

/// Convert an OpenAPI schema to a JSON Schema value (structural subset).
fn schema_to_json(schema: &Schema) -> Value {
    let mut result = json!({});

    if let Some(description) = &schema.schema_data.description {
        result["description"] = json!(description);
    }

    match &schema.schema_kind {
        SchemaKind::Type(Type::String(s)) => {
            result["type"] = json!("string");
            let enumeration: Vec<&String> = s.enumeration.iter().flatten().collect();
            if !enumeration.is_empty() {
                result["enum"] = json!(enumeration);
            }
        }
        SchemaKind::Type(Type::Number(_)) => {
            result["type"] = json!("number");
        }
        SchemaKind::Type(Type::Integer(_)) => {
            result["type"] = json!("integer");
        }
        SchemaKind::Type(Type::Boolean(_)) => {
            result["type"] = json!("boolean");
        }
        SchemaKind::Type(Type::Array(a)) => {
            result["type"] = json!("array");
            if let Some(items) = &a.items {
                result["items"] = match items {
                    ReferenceOr::Item(item) => schema_to_json(item),
                    ReferenceOr::Reference { reference } => json!({ "$ref": reference }),
                };
            }
        }
        SchemaKind::Type(Type::Object(o)) => {
            result["type"] = json!("object");
            if !o.properties.is_empty() {
                let mut props = Map::new();
                for (name, prop) in &o.properties {
                    let value = match prop {
                        ReferenceOr::Item(item) => schema_to_json(item),
                        ReferenceOr::Reference { reference } => json!({ "$ref": reference }),
                    };
                    props.insert(name.clone(), value);
                }
                result["properties"] = Value::Object(props);
            }
            if !o.required.is_empty() {
                result["required"] = json!(o.required);
            }
        }
        _ => {}
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> OpenAPI {
        serde_yaml::from_str(raw).unwrap()
    }

    const PETSTORE: &str = r##"
openapi: 3.0.0
info:
  title: Petstore
  version: 1.0.0
paths:
  /pets:
    get:
      operationId: listPets
      summary: List all pets
      parameters:
        - name: limit
          in: query
          required: false
          schema:
            type: integer
            default: 20
      responses:
        "200":
          description: ok
    post:
      operationId: createPet
      requestBody:
        required: true
        content:
          application/json:
            schema:
              type: object
              properties:
                name:
                  type: string
      responses:
        "201":
          description: created
  /pets/{petId}:
    parameters:
      - name: petId
        in: path
        required: true
        schema:
          type: string
    get:
      operationId: getPet
      responses:
        "200":
          description: ok
    delete:
      responses:
        "204":
          description: gone
"##;

    #[test]
    fn one_operation_per_path_method_in_stable_order() {
        let ops = compile(&parse(PETSTORE));
        let ids: Vec<&str> = ops.iter().map(|o| o.operation_id.as_str()).collect();
        assert_eq!(ids, ["listPets", "createPet", "getPet", "deletePetsPetId"]);

        let pairs: Vec<(&str, &str)> =
            ops.iter().map(|o| (o.method.as_str(), o.path.as_str())).collect();
        assert_eq!(
            pairs,
            [
                ("GET", "/pets"),
                ("POST", "/pets"),
                ("GET", "/pets/{petId}"),
                ("DELETE", "/pets/{petId}"),
            ]
        );
    }

    #[test]
    fn operation_id_synthesis() {
        assert_eq!(synthesize_operation_id("GET", "/pets/{petId}/owners"), "getPetsPetIdOwners");
        assert_eq!(synthesize_operation_id("POST", "/store/order"), "postStoreOrder");
        assert_eq!(synthesize_operation_id("GET", "/"), "get");
        assert_eq!(synthesize_operation_id("DELETE", "/Users/{id}"), "deleteUsersId");
    }

    #[test]
    fn synthesized_tool_requires_path_params_and_omits_body() {
        let raw = r##"
openapi: 3.0.0
info:
  title: t
  version: 1.0.0
paths:
  /pets/{petId}/owners:
    get:
      parameters:
        - name: petId
          in: path
          required: true
          schema:
            type: string
      responses:
        "200":
          description: ok
"##;
        let ops = compile(&parse(raw));
        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.operation_id, "getPetsPetIdOwners");
        assert_eq!(op.tool.input_schema["required"], json!(["petId"]));
        assert!(op.tool.input_schema["properties"].get("body").is_none());
    }

    #[test]
    fn path_level_params_come_first_and_operation_level_wins_duplicates() {
        let raw = r##"
openapi: 3.0.0
info:
  title: t
  version: 1.0.0
paths:
  /items/{id}:
    parameters:
      - name: id
        in: path
        required: true
        schema:
          type: string
      - name: verbose
        in: query
        schema:
          type: boolean
    get:
      parameters:
        - name: verbose
          in: query
          schema:
            type: integer
      responses:
        "200":
          description: ok
"##;
        let ops = compile(&parse(raw));
        let params = &ops[0].parameters;
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "id");
        assert_eq!(params[1].name, "verbose");
        // Operation-level entry replaced the path-level one.
        assert_eq!(params[1].scalar, ScalarType::Integer);
    }

    #[test]
    fn body_content_type_preference() {
        let raw = r##"
openapi: 3.0.0
info:
  title: t
  version: 1.0.0
paths:
  /a:
    post:
      requestBody:
        content:
          text/plain:
            schema:
              type: string
          application/json:
            schema:
              type: object
      responses:
        "200":
          description: ok
  /b:
    post:
      requestBody:
        content:
          application/xml:
            schema:
              type: object
      responses:
        "200":
          description: ok
"##;
        let ops = compile(&parse(raw));
        assert_eq!(ops[0].body.as_ref().unwrap().content_type, "application/json");
        assert_eq!(ops[1].body.as_ref().unwrap().content_type, "application/xml");
    }

    #[test]
    fn required_body_lands_in_tool_required_list() {
        let ops = compile(&parse(PETSTORE));
        let create = ops.iter().find(|o| o.operation_id == "createPet").unwrap();
        assert_eq!(create.tool.input_schema["required"], json!(["body"]));
        assert_eq!(
            create.tool.input_schema["properties"]["body"]["contentType"],
            json!("application/json")
        );
        assert_eq!(create.required_parameter_names(), vec!["body".to_string()]);
    }

    #[test]
    fn defaults_and_enums_propagate_into_tool_schema() {
        let raw = r##"
openapi: 3.0.0
info:
  title: t
  version: 1.0.0
paths:
  /pets:
    get:
      parameters:
        - name: status
          in: query
          schema:
            type: string
            enum: [available, pending, sold]
        - name: limit
          in: query
          schema:
            type: integer
            default: 20
      responses:
        "200":
          description: ok
"##;
        let ops = compile(&parse(raw));
        let schema = &ops[0].tool.input_schema;
        assert_eq!(
            schema["properties"]["status"]["enum"],
            json!(["available", "pending", "sold"])
        );
        assert_eq!(schema["properties"]["limit"]["default"], json!(20));
    }

    #[test]
    fn internal_component_refs_resolve() {
        let raw = r##"
openapi: 3.0.0
info:
  title: t
  version: 1.0.0
paths:
  /pets:
    get:
      parameters:
        - $ref: "#/components/parameters/Limit"
      responses:
        "200":
          description: ok
components:
  parameters:
    Limit:
      name: limit
      in: query
      required: true
      schema:
        type: integer
"##;
        let ops = compile(&parse(raw));
        let param = &ops[0].parameters[0];
        assert_eq!(param.name, "limit");
        assert_eq!(param.scalar, ScalarType::Integer);
        assert!(param.required);
    }

    #[test]
    fn duplicate_operation_ids_are_disambiguated() {
        let raw = r##"
openapi: 3.0.0
info:
  title: t
  version: 1.0.0
paths:
  /a:
    get:
      operationId: fetch
      responses:
        "200":
          description: ok
  /b:
    get:
      operationId: fetch
      responses:
        "200":
          description: ok
"##;
        let ops = compile(&parse(raw));
        assert_eq!(ops[0].operation_id, "fetch");
        assert_eq!(ops[1].operation_id, "fetch_1");
    }

    #[test]
    fn head_options_trace_are_compiled() {
        let raw = r##"
openapi: 3.0.0
info:
  title: t
  version: 1.0.0
paths:
  /probe:
    head:
      responses:
        "200":
          description: ok
    options:
      responses:
        "200":
          description: ok
    trace:
      responses:
        "200":
          description: ok
"##;
        let ops = compile(&parse(raw));
        let methods: Vec<&str> = ops.iter().map(|o| o.method.as_str()).collect();
        assert_eq!(methods, ["HEAD", "OPTIONS", "TRACE"]);
    }

    #[test]
    fn scalar_type_validation() {
        assert!(ScalarType::Integer.accepts(&json!(3)));
        assert!(!ScalarType::Integer.accepts(&json!(3.5)));
        assert!(ScalarType::Number.accepts(&json!(3.5)));
        assert!(ScalarType::Boolean.accepts(&json!(true)));
        assert!(ScalarType::String.accepts(&json!("x")));
        assert!(!ScalarType::String.accepts(&json!(1)));
        assert!(ScalarType::Array.accepts(&json!([1, 2])));
        assert!(ScalarType::Object.accepts(&json!({"a": 1})));
    }

    #[test]
    fn tool_descriptor_materializes_rmcp_tool() {
        let ops = compile(&parse(PETSTORE));
        let tool = ops[0].tool.to_tool();
        assert_eq!(tool.name, "listPets");
        assert!(tool.input_schema.contains_key("properties"));
    }

    #[test]
    fn routes_reflect_operations() {
        let ops = compile(&parse(PETSTORE));
        let routes = routes("petstore", &ops);
        assert_eq!(routes.len(), 4);
        assert_eq!(routes[0].service_name, "petstore");
        assert_eq!(routes[0].operation_id.as_deref(), Some("listPets"));
        assert_eq!(routes[0].summary.as_deref(), Some("List all pets"));
    }
}
