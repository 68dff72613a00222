use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{AppError, AppResult, ErrorCode};
use super::query::matches;
use super::schema::{check_fields, FieldType};
use super::{apply_ops, DatabaseAdapter, FindOptions, Object, RunOptions};

#[derive(Default)]
struct Collection {
    /// Insertion ordered; "first match" lookups depend on it.
    rows: Vec<Object>,
    schema: HashMap<String, FieldType>,
}

/// Process-local object database keeping every class in memory.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    classes: Arc<RwLock<HashMap<String, Collection>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self { Self::default() }

    /// Number of stored objects in a class (0 when the class does not exist).
    pub fn count(&self, class_name: &str) -> usize {
        self.classes.read().get(class_name).map(|c| c.rows.len()).unwrap_or(0)
    }
}

fn acl_allows_write(row: &Object, acl: &[String]) -> bool {
    let Some(row_acl) = row.get("ACL").and_then(|v| v.as_object()) else { return true; };
    acl.iter().any(|entry| {
        row_acl.get(entry).and_then(|perms| perms.get("write")).and_then(|w| w.as_bool()).unwrap_or(false)
    })
}

#[async_trait]
impl DatabaseAdapter for MemoryDatabase {
    async fn collection_exists(&self, class_name: &str) -> AppResult<bool> {
        Ok(self.classes.read().contains_key(class_name))
    }

    async fn validate_object(&self, class_name: &str, data: &Object, _query: Option<&Object>, _options: &RunOptions) -> AppResult<()> {
        let mut classes = self.classes.write();
        // a rejected write must not bring the class into existence
        let additions = match classes.get(class_name) {
            Some(collection) => check_fields(class_name, &collection.schema, data)?,
            None => check_fields(class_name, &HashMap::new(), data)?,
        };
        let collection = classes.entry(class_name.to_string()).or_default();
        for (name, ty) in additions {
            debug!(target: "basalt::storage", "validate_object: class='{}' new field='{}' type={}", class_name, name, ty.label());
            collection.schema.insert(name, ty);
        }
        Ok(())
    }

    async fn find(&self, class_name: &str, query: &Object, options: &FindOptions) -> AppResult<Vec<Object>> {
        let classes = self.classes.read();
        let Some(collection) = classes.get(class_name) else { return Ok(Vec::new()); };
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(collection.rows.iter().filter(|r| matches(r, query)).take(limit).cloned().collect())
    }

    async fn create(&self, class_name: &str, data: &Object, _options: &RunOptions) -> AppResult<()> {
        let mut classes = self.classes.write();
        let collection = classes.entry(class_name.to_string()).or_default();
        let id = data.get("objectId").and_then(|v| v.as_str());
        if id.is_some() && collection.rows.iter().any(|r| r.get("objectId").and_then(|v| v.as_str()) == id) {
            return Err(AppError::new(ErrorCode::DuplicateValue, "A duplicate value for a field with unique values was provided"));
        }
        let mut row = Object::new();
        apply_ops(&mut row, data);
        debug!(target: "basalt::storage", "create: class='{}' objectId={:?}", class_name, id);
        collection.rows.push(row);
        Ok(())
    }

    async fn update(&self, class_name: &str, query: &Object, data: &Object, options: &RunOptions) -> AppResult<Object> {
        let mut classes = self.classes.write();
        let not_found = || AppError::not_found("Object not found.");
        let collection = classes.get_mut(class_name).ok_or_else(not_found)?;
        let row = collection.rows.iter_mut().find(|r| matches(r, query)).ok_or_else(not_found)?;
        if let Some(acl) = options.acl.as_deref() {
            if !acl_allows_write(row, acl) { return Err(not_found()); }
        }
        let response = apply_ops(row, data);
        debug!(target: "basalt::storage", "update: class='{}' fields={}", class_name, data.len());
        Ok(response)
    }

    async fn destroy(&self, class_name: &str, query: &Object) -> AppResult<()> {
        let mut classes = self.classes.write();
        if let Some(collection) = classes.get_mut(class_name) {
            let before = collection.rows.len();
            collection.rows.retain(|r| !matches(r, query));
            debug!(target: "basalt::storage", "destroy: class='{}' removed={}", class_name, before - collection.rows.len());
        }
        Ok(())
    }
}
