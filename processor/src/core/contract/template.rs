//! Payload templates.
//!
//! A contract's template maps payload field names to a descriptor object
//! whose `type` names one of the known kinds; a trailing `?` marks the
//! field optional. Payloads must match the template exactly: no missing
//! required fields, no extras, no type mismatches.

use serde_json::{Map, Value};

type JsonMap = Map<String, Value>;

const KNOWN_KINDS: &[&str] = &[
    "str", "int", "uint", "float", "bool", "array", "object", "json", "hash", "base64", "addr",
];

/// Check that a template itself is well formed.
pub fn validate_template(template: &JsonMap) -> Result<(), String> {
    for (field, descriptor) in template {
        let descriptor = descriptor
            .as_object()
            .ok_or_else(|| format!("descriptor of {field} is not an object"))?;
        let kind = descriptor
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("descriptor of {field} has no type"))?;
        let kind = kind.strip_suffix('?').unwrap_or(kind);
        if !KNOWN_KINDS.contains(&kind) {
            return Err(format!("unknown type {kind} for {field}"));
        }
    }
    Ok(())
}

/// Validate a payload object against a template.
pub fn validate_payload(template: &JsonMap, payload: &JsonMap) -> Result<(), String> {
    for field in payload.keys() {
        if !template.contains_key(field) {
            return Err(format!("unexpected field {field}"));
        }
    }
    for (field, descriptor) in template {
        let kind = descriptor
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("json");
        let (kind, optional) = match kind.strip_suffix('?') {
            Some(kind) => (kind, true),
            None => (kind, false),
        };
        match payload.get(field) {
            None | Some(Value::Null) => {
                if !optional {
                    return Err(format!("missing field {field}"));
                }
            }
            Some(value) => {
                if !matches_kind(kind, value) {
                    return Err(format!("field {field} is not a {kind}"));
                }
            }
        }
    }
    Ok(())
}

fn matches_kind(kind: &str, value: &Value) -> bool {
    match kind {
        "str" => value.is_string(),
        "int" => value.as_i64().is_some(),
        "uint" => value.as_u64().is_some(),
        "float" => value.is_number(),
        "bool" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "json" => true,
        "hash" => value
            .as_str()
            .map(|s| s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()))
            .unwrap_or(false),
        "base64" => value
            .as_str()
            .map(|s| {
                !s.is_empty()
                    && s.bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b"+/=".contains(&b))
            })
            .unwrap_or(false),
        "addr" => value
            .as_str()
            .map(|s| !s.is_empty() && s.len() <= ledger_common::config::MAX_ADDRESS_LENGTH)
            .unwrap_or(false),
        _ => false,
    }
}
