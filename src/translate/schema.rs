//! JSON Schema sanitization for upstream tool declarations.
//!
//! The upstream accepts a small subset of JSON Schema. Client schemas are
//! reduced to it in three steps:
//!
//! 1. `$ref`s into `$defs`/`definitions` are inlined. A reference already being
//!    expanded on the current path is dropped instead of expanded again, so
//!    recursive schemas terminate.
//! 2. Unsupported keywords are stripped, `anyOf`/`oneOf` collapse to their
//!    first option, `const` becomes a one-value `enum` and type arrays
//!    collapse to their first valid type.
//! 3. The result is forced to be an object schema.
//!
//! Recursion is capped at [`MAX_DEPTH`]; anything deeper is returned as-is.

use serde_json::{json, Map, Value};
use std::collections::HashSet;

pub const MAX_DEPTH: usize = 20;

const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "$comment",
    "$vocabulary",
    "definitions",
    "propertyNames",
    "additionalProperties",
    "additionalItems",
    "unevaluatedProperties",
    "unevaluatedItems",
    "contentEncoding",
    "contentMediaType",
    "contentSchema",
    "if",
    "then",
    "else",
    "allOf",
    "anyOf",
    "oneOf",
    "not",
    "minContains",
    "maxContains",
    "dependentRequired",
    "dependentSchemas",
    "prefixItems",
    "contains",
    "patternProperties",
    "deprecated",
    "minItems",
    "maxItems",
    "pattern",
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "default",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "format",
    "minProperties",
    "maxProperties",
    "uniqueItems",
    "readOnly",
    "writeOnly",
    "examples",
    "title",
];

const VALID_TYPES: &[&str] = &[
    "string", "number", "integer", "boolean", "array", "object", "null",
];

const REF_PREFIXES: &[&str] = &["#/$defs/", "#/definitions/"];

/// Produce an upstream-safe parameter schema for one tool.
pub fn sanitize_tool_schema(params: Option<&Value>) -> Value {
    let Some(params) = params.filter(|p| p.is_object()) else {
        return empty_object_schema();
    };

    let inlined = inline_refs(params);
    match clean_schema(&inlined, 0) {
        Some(Value::Object(mut cleaned)) => {
            if cleaned.get("type").and_then(Value::as_str) != Some("object") {
                cleaned.insert("type".to_string(), json!("object"));
            }
            Value::Object(cleaned)
        }
        _ => empty_object_schema(),
    }
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Inline local `$ref`s using the root's `$defs` or `definitions`.
pub fn inline_refs(schema: &Value) -> Value {
    let defs = schema
        .get("$defs")
        .or_else(|| schema.get("definitions"))
        .and_then(Value::as_object);

    match defs {
        Some(defs) if !defs.is_empty() => resolve(schema, defs, &HashSet::new(), 0),
        _ => schema.clone(),
    }
}

fn resolve(node: &Value, defs: &Map<String, Value>, seen: &HashSet<String>, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return node.clone();
    }

    match node {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve(item, defs, seen, depth + 1))
                .collect(),
        ),
        Value::Object(obj) => {
            if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
                if !seen.contains(reference) {
                    if let Some(target) = lookup_def(reference, defs) {
                        let mut seen = seen.clone();
                        seen.insert(reference.to_string());
                        return resolve(target, defs, &seen, depth + 1);
                    }
                }
            }

            Value::Object(
                obj.iter()
                    .filter(|(k, _)| k.as_str() != "$ref")
                    .map(|(k, v)| (k.clone(), resolve(v, defs, seen, depth + 1)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

fn lookup_def<'a>(reference: &str, defs: &'a Map<String, Value>) -> Option<&'a Value> {
    REF_PREFIXES
        .iter()
        .find_map(|prefix| reference.strip_prefix(prefix))
        .and_then(|name| defs.get(name))
}

/// Strip a schema down to supported keywords. `None` means nothing useful was left.
pub fn clean_schema(value: &Value, depth: usize) -> Option<Value> {
    if depth > MAX_DEPTH {
        return Some(value.clone());
    }

    match value {
        Value::Null => None,
        Value::Array(items) => {
            let cleaned: Vec<Value> = items
                .iter()
                .filter_map(|item| clean_schema(item, depth + 1))
                .collect();
            (!cleaned.is_empty()).then_some(Value::Array(cleaned))
        }
        Value::Object(obj) => clean_object(obj, depth),
        scalar => Some(scalar.clone()),
    }
}

fn clean_object(obj: &Map<String, Value>, depth: usize) -> Option<Value> {
    for union in ["anyOf", "oneOf"] {
        if let Some(first) = obj.get(union).and_then(Value::as_array).and_then(|o| o.first()) {
            if let Some(option @ Value::Object(_)) = clean_schema(first, depth + 1) {
                return Some(option);
            }
        }
    }

    let mut result = Map::new();
    if let Some(constant) = obj.get("const") {
        result.insert("enum".to_string(), Value::Array(vec![constant.clone()]));
    }

    for (key, value) in obj {
        if key == "const" || value.is_null() || UNSUPPORTED_KEYWORDS.contains(&key.as_str()) {
            continue;
        }

        match key.as_str() {
            "type" => {
                if let Some(t) = first_valid_type(value) {
                    result.insert(key.clone(), Value::String(t.to_string()));
                }
            }
            "properties" => {
                if let Value::Object(props) = value {
                    let cleaned: Map<String, Value> = props
                        .iter()
                        .filter_map(|(name, prop)| {
                            clean_schema(prop, depth + 1)
                                .filter(is_non_empty_object)
                                .map(|p| (name.clone(), p))
                        })
                        .collect();
                    if !cleaned.is_empty() {
                        result.insert(key.clone(), Value::Object(cleaned));
                    }
                }
            }
            "items" => {
                if let Some(items) = clean_schema(value, depth + 1).filter(is_non_empty_object) {
                    result.insert(key.clone(), items);
                }
            }
            _ => {
                if let Some(cleaned) = clean_schema(value, depth + 1) {
                    result.insert(key.clone(), cleaned);
                }
            }
        }
    }

    prune_required(&mut result);
    (!result.is_empty()).then_some(Value::Object(result))
}

/// `required` may only name properties that survived cleaning.
fn prune_required(schema: &mut Map<String, Value>) {
    let Some(Value::Array(required)) = schema.get("required") else {
        return;
    };
    let kept: Vec<Value> = match schema.get("properties").and_then(Value::as_object) {
        Some(props) => required
            .iter()
            .filter(|r| r.as_str().is_some_and(|name| props.contains_key(name)))
            .cloned()
            .collect(),
        None => Vec::new(),
    };
    if kept.is_empty() {
        schema.remove("required");
    } else {
        schema.insert("required".to_string(), Value::Array(kept));
    }
}

fn first_valid_type(value: &Value) -> Option<&str> {
    match value {
        Value::String(t) if VALID_TYPES.contains(&t.as_str()) => Some(t.as_str()),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| VALID_TYPES.contains(t)),
        _ => None,
    }
}

fn is_non_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(|o| !o.is_empty())
}
