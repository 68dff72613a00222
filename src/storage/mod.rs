//!
//! basalt storage module
//! ---------------------
//! This module defines the contract the write pipeline uses to talk to the object
//! database, plus an in-memory implementation used by the server binary and tests.
//!
//! Objects travel in REST format: a JSON map whose special values are encoded as
//! typed sub-objects (`{"__type":"Pointer",...}`, `{"__type":"Date",...}`,
//! `{"__type":"File",...}`) or field operations (`{"__op":"Delete"}`,
//! `{"__op":"Increment","amount":n}`).
//!
//! Key responsibilities:
//! - Collection existence checks and schema validation with type inference.
//! - Find with equality / `$ne` / `$in` / `$exists` / `$or` matching on dotted keys.
//! - Create, update (with ACL filtering) and best-effort destroy.
//!
//! The public API centers around the `DatabaseAdapter` trait, usually wrapped in a
//! `SharedDatabase` (`Arc<dyn DatabaseAdapter>`) held by the app `Config`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::AppResult;

mod memory;
pub mod query;
pub mod schema;

pub use memory::MemoryDatabase;

/// A single object in REST format.
pub type Object = serde_json::Map<String, Value>;

/// Transient flags forwarded to the database on writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Effective read/write set of the caller (`"*"`, `role:<name>` entries, user id).
    /// `None` means unrestricted (master).
    pub acl: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub limit: Option<usize>,
    pub acl: Option<Vec<String>>,
}

impl FindOptions {
    pub fn limit(n: usize) -> Self { Self { limit: Some(n), acl: None } }
}

/// Object database contract consumed by the write pipeline.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    async fn collection_exists(&self, class_name: &str) -> AppResult<bool>;

    /// Validate `data` against the class schema, registering new fields.
    async fn validate_object(&self, class_name: &str, data: &Object, query: Option<&Object>, options: &RunOptions) -> AppResult<()>;

    async fn find(&self, class_name: &str, query: &Object, options: &FindOptions) -> AppResult<Vec<Object>>;

    async fn create(&self, class_name: &str, data: &Object, options: &RunOptions) -> AppResult<()>;

    /// Update the first object matching `query`; returns the fields the caller
    /// cannot infer from its own payload (e.g. results of increments).
    async fn update(&self, class_name: &str, query: &Object, data: &Object, options: &RunOptions) -> AppResult<Object>;

    /// Best-effort removal of every object matching `query`.
    async fn destroy(&self, class_name: &str, query: &Object) -> AppResult<()>;
}

pub type SharedDatabase = Arc<dyn DatabaseAdapter>;

/// Pointer encoding used for relations such as `_Session.user`.
pub fn pointer(class_name: &str, object_id: &str) -> Value {
    json!({ "__type": "Pointer", "className": class_name, "objectId": object_id })
}

/// Date encoding used for non-system timestamps such as `expiresAt`.
pub fn date(iso: &str) -> Value {
    json!({ "__type": "Date", "iso": iso })
}

/// Build a single-key equality query.
pub fn query_eq(key: &str, value: impl Into<Value>) -> Object {
    let mut q = Object::new();
    q.insert(key.to_string(), value.into());
    q
}

/// Apply REST field operations onto `row`, returning the values the caller
/// cannot derive from its own payload.
pub fn apply_ops(row: &mut Object, data: &Object) -> Object {
    let mut response = Object::new();
    for (key, value) in data.iter() {
        let op = value.as_object().and_then(|m| m.get("__op")).and_then(|o| o.as_str());
        match op {
            Some("Delete") => { row.remove(key); }
            Some("Increment") => {
                let amount = value.get("amount").cloned().unwrap_or(json!(0));
                let next = match (row.get(key).and_then(|v| v.as_i64()), amount.as_i64()) {
                    // overflow falls back to a float sum
                    (Some(cur), Some(by)) => cur.checked_add(by).map_or_else(|| json!(cur as f64 + by as f64), |n| json!(n)),
                    (None, Some(by)) if !row.contains_key(key) => json!(by),
                    _ => {
                        let cur = row.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
                        json!(cur + amount.as_f64().unwrap_or(0.0))
                    }
                };
                row.insert(key.clone(), next.clone());
                response.insert(key.clone(), next);
            }
            Some("Add") | Some("AddUnique") => {
                let objects = value.get("objects").and_then(|o| o.as_array()).cloned().unwrap_or_default();
                let unique = op == Some("AddUnique");
                let entry = row.entry(key.clone()).or_insert_with(|| Value::Array(vec![]));
                if let Value::Array(items) = entry {
                    for o in objects {
                        if !unique || !items.contains(&o) { items.push(o); }
                    }
                    response.insert(key.clone(), Value::Array(items.clone()));
                }
            }
            Some("Remove") => {
                let objects = value.get("objects").and_then(|o| o.as_array()).cloned().unwrap_or_default();
                if let Some(Value::Array(items)) = row.get_mut(key) {
                    items.retain(|i| !objects.contains(i));
                    response.insert(key.clone(), Value::Array(items.clone()));
                }
            }
            _ => { row.insert(key.clone(), value.clone()); }
        }
    }
    response
}
