//! Validation of tool arguments against their JSON schema.
//!
//! This covers the subset of JSON Schema that tool definitions use in
//! practice, including the output of `schemars`. Keywords that are not
//! understood are ignored.

use serde_json::{Map, Value};

const MAX_DEPTH: usize = 32;

/// An argument validation failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {reason}")]
pub struct ValidationError {
    /// Location of the offending value, such as `$.items[2].name`.
    pub path: String,
    /// What is wrong with it.
    pub reason: String,
}

/// Validates `value` against `schema`.
pub fn validate(schema: &Value, value: &Value) -> Result<(), ValidationError> {
    Validator { root: schema }.check(schema, value, "$", 0)
}

struct Validator<'a> {
    root: &'a Value,
}

fn fail<T>(path: &str, reason: impl Into<String>) -> Result<T, ValidationError> {
    Err(ValidationError {
        path: path.to_owned(),
        reason: reason.into(),
    })
}

impl Validator<'_> {
    fn check(
        &self,
        schema: &Value,
        value: &Value,
        path: &str,
        depth: usize,
    ) -> Result<(), ValidationError> {
        if depth > MAX_DEPTH {
            return fail(path, "schema is nested too deeply");
        }
        let obj = match schema {
            Value::Object(obj) => obj,
            Value::Bool(false) => return fail(path, "no value is allowed here"),
            _ => return Ok(()),
        };

        if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
            let Some(target) = self.resolve(reference) else {
                return fail(path, format!("unresolvable reference `{reference}`"));
            };
            self.check(target, value, path, depth + 1)?;
        }

        if let Some(ty) = obj.get("type") {
            check_type(ty, value, path)?;
        }
        if let Some(allowed) = obj.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return fail(path, format!("must be one of {}", Value::from(allowed.clone())));
            }
        }
        if let Some(expected) = obj.get("const") {
            if expected != value {
                return fail(path, format!("must be {expected}"));
            }
        }

        match value {
            Value::String(s) => check_string(obj, s, path)?,
            Value::Number(_) => check_number(obj, value, path)?,
            Value::Object(map) => self.check_object(obj, map, path, depth)?,
            Value::Array(items) => {
                if let Some(item_schema) = obj.get("items") {
                    for (idx, item) in items.iter().enumerate() {
                        self.check(item_schema, item, &format!("{path}[{idx}]"), depth + 1)?;
                    }
                }
            }
            _ => {}
        }

        if let Some(all_of) = obj.get("allOf").and_then(Value::as_array) {
            for sub in all_of {
                self.check(sub, value, path, depth + 1)?;
            }
        }
        if let Some(any_of) = obj.get("anyOf").and_then(Value::as_array) {
            let mut first_err = None;
            let matched = any_of.iter().any(|sub| match self.check(sub, value, path, depth + 1) {
                Ok(()) => true,
                Err(err) => {
                    first_err.get_or_insert(err);
                    false
                }
            });
            if !matched {
                return Err(single_or_generic(any_of.len(), first_err, path));
            }
        }
        if let Some(one_of) = obj.get("oneOf").and_then(Value::as_array) {
            let mut first_err = None;
            let mut matches = 0;
            for sub in one_of {
                match self.check(sub, value, path, depth + 1) {
                    Ok(()) => matches += 1,
                    Err(err) => {
                        first_err.get_or_insert(err);
                    }
                }
            }
            match matches {
                0 => return Err(single_or_generic(one_of.len(), first_err, path)),
                1 => {}
                _ => return fail(path, "matches more than one allowed schema"),
            }
        }
        Ok(())
    }

    fn check_object(
        &self,
        schema: &Map<String, Value>,
        map: &Map<String, Value>,
        path: &str,
        depth: usize,
    ) -> Result<(), ValidationError> {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(name) {
                    return fail(&format!("{path}.{name}"), "missing required property");
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let additional = schema.get("additionalProperties");
        for (name, child) in map {
            let child_path = format!("{path}.{name}");
            match properties.and_then(|props| props.get(name)) {
                Some(child_schema) => {
                    self.check(child_schema, child, &child_path, depth + 1)?;
                }
                None => match additional {
                    Some(Value::Bool(false)) => {
                        return fail(&child_path, "unexpected property");
                    }
                    Some(additional) => {
                        self.check(additional, child, &child_path, depth + 1)?;
                    }
                    None => {}
                },
            }
        }
        Ok(())
    }

    fn resolve(&self, reference: &str) -> Option<&Value> {
        // Only local references are supported, such as `#/$defs/Unit`.
        let pointer = reference.strip_prefix('#')?;
        if pointer.is_empty() {
            return Some(self.root);
        }
        self.root.pointer(pointer)
    }
}

fn single_or_generic(
    alternatives: usize,
    first_err: Option<ValidationError>,
    path: &str,
) -> ValidationError {
    match first_err {
        // With one alternative the nested reason is the most helpful.
        Some(err) if alternatives == 1 => err,
        _ => ValidationError {
            path: path.to_owned(),
            reason: "does not match any allowed schema".to_owned(),
        },
    }
}

fn check_type(ty: &Value, value: &Value, path: &str) -> Result<(), ValidationError> {
    let allowed: Vec<&str> = match ty {
        Value::String(ty) => vec![ty.as_str()],
        Value::Array(types) => types.iter().filter_map(Value::as_str).collect(),
        _ => return Ok(()),
    };
    if allowed.is_empty() || allowed.iter().any(|ty| matches_type(ty, value)) {
        return Ok(());
    }
    fail(
        path,
        format!("expected {}, found {}", allowed.join(" or "), type_name(value)),
    )
}

fn matches_type(ty: &str, value: &Value) -> bool {
    match ty {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        // Unknown type names do not constrain anything.
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_string(
    schema: &Map<String, Value>,
    s: &str,
    path: &str,
) -> Result<(), ValidationError> {
    let len = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if len < min {
            return fail(path, format!("must be at least {min} characters long"));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if len > max {
            return fail(path, format!("must be at most {max} characters long"));
        }
    }
    Ok(())
}

fn check_number(
    schema: &Map<String, Value>,
    value: &Value,
    path: &str,
) -> Result<(), ValidationError> {
    let Some(n) = value.as_f64() else {
        return Ok(());
    };
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if n < min {
            return fail(path, format!("must be at least {min}"));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if n > max {
            return fail(path, format!("must be at most {max}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use schemars::{JsonSchema, schema_for};
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    fn weather_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": { "type": "string", "minLength": 1 },
                "unit": { "enum": ["celsius", "fahrenheit"] },
                "days": { "type": "integer", "minimum": 1, "maximum": 7 }
            },
            "required": ["location"],
            "additionalProperties": false
        })
    }

    fn reason(schema: &Value, value: Value) -> String {
        validate(schema, &value).unwrap_err().to_string()
    }

    #[test]
    fn test_object_keywords() {
        let schema = weather_schema();
        assert!(validate(&schema, &json!({ "location": "Pittsburgh", "days": 3 })).is_ok());

        assert_eq!(reason(&schema, json!({})), "$.location: missing required property");
        assert_eq!(
            reason(&schema, json!({ "location": "x", "hourly": true })),
            "$.hourly: unexpected property"
        );
        assert_eq!(
            reason(&schema, json!({ "location": 42 })),
            "$.location: expected string, found integer"
        );
        assert_eq!(
            reason(&schema, json!({ "location": "" })),
            "$.location: must be at least 1 characters long"
        );
        assert_eq!(
            reason(&schema, json!({ "location": "x", "unit": "kelvin" })),
            "$.unit: must be one of [\"celsius\",\"fahrenheit\"]"
        );
        assert_eq!(
            reason(&schema, json!({ "location": "x", "days": 1.5 })),
            "$.days: expected integer, found number"
        );
        assert_eq!(
            reason(&schema, json!({ "location": "x", "days": 8 })),
            "$.days: must be at most 7"
        );
        // Unparsable arguments are passed through as strings.
        assert_eq!(
            reason(&schema, json!("{\"location\":")),
            "$: expected object, found string"
        );
    }

    #[test]
    fn test_items_and_alternatives() {
        let schema = json!({
            "type": "object",
            "properties": {
                "tags": { "type": "array", "items": { "type": "string" } },
                "limit": { "anyOf": [{ "type": "integer" }, { "type": "null" }] },
                "mode": { "oneOf": [{ "const": "fast" }, { "const": "slow" }] }
            }
        });
        assert!(validate(&schema, &json!({ "tags": ["a"], "limit": null, "mode": "fast" })).is_ok());
        assert_eq!(
            reason(&schema, json!({ "tags": ["a", 1] })),
            "$.tags[1]: expected string, found integer"
        );
        assert_eq!(
            reason(&schema, json!({ "limit": "ten" })),
            "$.limit: does not match any allowed schema"
        );
        assert_eq!(
            reason(&schema, json!({ "mode": "medium" })),
            "$.mode: does not match any allowed schema"
        );
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    enum Unit {
        Celsius,
        Fahrenheit,
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Forecast {
        location: String,
        unit: Option<Unit>,
        days: Option<u8>,
    }

    #[test]
    fn test_schemars_output() {
        let schema = schema_for!(Forecast).to_value();
        assert!(validate(&schema, &json!({ "location": "Boston" })).is_ok());
        assert!(validate(&schema, &json!({ "location": "Boston", "unit": "Celsius", "days": 3 })).is_ok());
        assert!(validate(&schema, &json!({ "location": "Boston", "unit": null })).is_ok());

        assert!(validate(&schema, &json!({ "location": "Boston", "unit": "Kelvin" })).is_err());
        assert_eq!(
            reason(&schema, json!({ "location": 5 })),
            "$.location: expected string, found integer"
        );
        assert_eq!(reason(&schema, json!({ "days": 1 })), "$.location: missing required property");
    }

    #[test]
    fn test_unresolvable_reference() {
        let schema = json!({ "$ref": "#/$defs/Missing" });
        assert_eq!(
            reason(&schema, json!({})),
            "$: unresolvable reference `#/$defs/Missing`"
        );
        assert!(validate(&json!(true), &json!(1)).is_ok());
        assert!(validate(&json!({}), &json!(1)).is_ok());
    }
}
