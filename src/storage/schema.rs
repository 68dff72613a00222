use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{AppError, AppResult, ErrorCode};
use crate::tprintln;
use super::Object;

/// Classes the server owns; their names bypass the client naming rule.
pub const SYSTEM_CLASSES: &[&str] = &["_User", "_Installation", "_Role", "_Session", "_Product"];

/// Fields every object carries, managed by the server.
const DEFAULT_FIELDS: &[&str] = &["objectId", "createdAt", "updatedAt", "ACL"];

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][0-9A-Za-z_]*$").expect("static regex"));
/// Server-internal fields (`_hashed_password`, `_email_verify_token`) carry a leading underscore.
static FIELD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^_?[A-Za-z][0-9A-Za-z_]*$").expect("static regex"));

/// Logical type of a stored field, inferred from the first value written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    File,
    Pointer(String),
    Array,
    Object,
}

impl FieldType {
    pub fn label(&self) -> String {
        match self {
            FieldType::String => "string".into(),
            FieldType::Number => "number".into(),
            FieldType::Boolean => "boolean".into(),
            FieldType::Date => "date".into(),
            FieldType::File => "file".into(),
            FieldType::Pointer(class) => format!("*{}", class),
            FieldType::Array => "array".into(),
            FieldType::Object => "object".into(),
        }
    }
}

pub fn class_name_is_valid(name: &str) -> bool {
    SYSTEM_CLASSES.contains(&name) || NAME_RE.is_match(name)
}

pub fn field_name_is_valid(name: &str) -> bool {
    FIELD_RE.is_match(name)
}

/// Infer the logical type of a REST value. `None` for nulls and deletions,
/// which never constrain the schema.
pub fn field_type_of(v: &Value) -> Option<FieldType> {
    match v {
        Value::Null => None,
        Value::Bool(_) => Some(FieldType::Boolean),
        Value::Number(_) => Some(FieldType::Number),
        Value::String(_) => Some(FieldType::String),
        Value::Array(_) => Some(FieldType::Array),
        Value::Object(m) => {
            if let Some(op) = m.get("__op").and_then(|x| x.as_str()) {
                return match op {
                    "Increment" => Some(FieldType::Number),
                    "Add" | "AddUnique" | "Remove" => Some(FieldType::Array),
                    _ => None,
                };
            }
            match m.get("__type").and_then(|x| x.as_str()) {
                Some("Pointer") => {
                    let class = m.get("className").and_then(|x| x.as_str()).unwrap_or_default();
                    Some(FieldType::Pointer(class.to_string()))
                }
                Some("Date") => Some(FieldType::Date),
                Some("File") => Some(FieldType::File),
                _ => Some(FieldType::Object),
            }
        }
    }
}

/// Check `data` against a class schema and return the fields it would add.
/// The schema itself is left untouched so a failed validation has no effect.
pub fn check_fields(class_name: &str, schema: &HashMap<String, FieldType>, data: &Object) -> AppResult<Vec<(String, FieldType)>> {
    if !class_name_is_valid(class_name) {
        return Err(AppError::new(ErrorCode::InvalidClassName, format!("Invalid classname: {}", class_name)));
    }
    let mut additions = Vec::new();
    for (key, value) in data.iter() {
        if DEFAULT_FIELDS.contains(&key.as_str()) { continue; }
        if !field_name_is_valid(key) {
            return Err(AppError::invalid_key(format!("invalid field name: {}", key)));
        }
        let Some(found) = field_type_of(value) else { continue; };
        match schema.get(key) {
            Some(expected) if *expected != found => {
                tprintln!("[SCHEMA] check_fields: class='{}' key='{}' expected={:?} found={:?}", class_name, key, expected, found);
                return Err(AppError::incorrect_type(format!(
                    "schema mismatch for {}.{}; expected {} but got {}",
                    class_name, key, expected.label(), found.label()
                )));
            }
            Some(_) => {}
            None => additions.push((key.clone(), found)),
        }
    }
    Ok(additions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Object { v.as_object().cloned().unwrap() }

    #[test]
    fn infers_special_types() {
        assert_eq!(field_type_of(&json!({"__type": "Pointer", "className": "_User", "objectId": "x"})), Some(FieldType::Pointer("_User".into())));
        assert_eq!(field_type_of(&json!({"__type": "Date", "iso": "2020-01-01T00:00:00.000Z"})), Some(FieldType::Date));
        assert_eq!(field_type_of(&json!({"__op": "Increment", "amount": 1})), Some(FieldType::Number));
        assert_eq!(field_type_of(&json!({"__op": "Delete"})), None);
        assert_eq!(field_type_of(&json!({"nested": 1})), Some(FieldType::Object));
    }

    #[test]
    fn mismatch_is_incorrect_type() {
        let mut schema = HashMap::new();
        schema.insert("score".to_string(), FieldType::Number);
        let err = check_fields("GameScore", &schema, &obj(json!({"score": "high"}))).unwrap_err();
        assert_eq!(err.code, ErrorCode::IncorrectType);
        let adds = check_fields("GameScore", &schema, &obj(json!({"score": 3, "player": "p"}))).unwrap();
        assert_eq!(adds, vec![("player".to_string(), FieldType::String)]);
    }

    #[test]
    fn rejects_bad_names() {
        let schema = HashMap::new();
        assert_eq!(check_fields("9lives", &schema, &Object::new()).unwrap_err().code, ErrorCode::InvalidClassName);
        assert_eq!(check_fields("_Session", &schema, &Object::new()).unwrap(), vec![]);
        assert_eq!(check_fields("Thing", &schema, &obj(json!({"$bad": 1}))).unwrap_err().code, ErrorCode::InvalidKeyName);
    }
}
