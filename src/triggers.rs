//! Before/after save hooks.
//!
//! Hooks are registered per (application id, class name, kind). The write
//! pipeline asks `trigger_exists` first so it can skip building object handles
//! when nothing is registered, then calls `maybe_run_trigger` with an inflated
//! `ObjectHandle` for the working copy and, on updates, the original object.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::error::AppResult;
use crate::identity::Auth;
use crate::storage::{apply_ops, Object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    BeforeSave,
    AfterSave,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::BeforeSave => "beforeSave",
            TriggerKind::AfterSave => "afterSave",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Identity given to an inflated object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InflateExtra {
    pub class_name: String,
    pub object_id: Option<String>,
}

/// Rich view of an object handed to hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHandle {
    class_name: String,
    object_id: Option<String>,
    fields: Object,
}

/// Build an `ObjectHandle` from raw REST data.
pub fn inflate(extra: &InflateExtra, raw: Option<&Object>) -> ObjectHandle {
    let mut fields = raw.cloned().unwrap_or_default();
    let object_id = extra
        .object_id
        .clone()
        .or_else(|| fields.get("objectId").and_then(|v| v.as_str()).map(str::to_string));
    fields.remove("objectId");
    fields.remove("className");
    ObjectHandle { class_name: extra.class_name.clone(), object_id, fields }
}

impl ObjectHandle {
    pub fn class_name(&self) -> &str { &self.class_name }

    pub fn object_id(&self) -> Option<&str> { self.object_id.as_deref() }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match key {
            "objectId" => None,
            _ => self.fields.get(key),
        }
    }

    /// Apply pending changes (plain values or `__op` operations).
    pub fn set(&mut self, data: &Object) {
        let mut pending = data.clone();
        if let Some(id) = pending.remove("objectId").and_then(|v| v.as_str().map(str::to_string)) {
            self.object_id = Some(id);
        }
        apply_ops(&mut self.fields, &pending);
    }

    /// Fold a save response into the handle: server fields win.
    pub fn handle_save_response(&mut self, response: &Object, status: u16) {
        for (key, value) in response.iter() {
            if key == "objectId" {
                if let Some(id) = value.as_str() { self.object_id = Some(id.to_string()); }
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
        if status == 201 {
            if let Some(created) = self.fields.get("createdAt").cloned() {
                self.fields.entry("updatedAt".to_string()).or_insert(created);
            }
        }
    }

    pub fn to_json(&self) -> Object {
        let mut out = self.fields.clone();
        out.insert("className".into(), Value::String(self.class_name.clone()));
        if let Some(id) = &self.object_id {
            out.insert("objectId".into(), Value::String(id.clone()));
        }
        out
    }
}

/// What a hook sees.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub kind: TriggerKind,
    pub master: bool,
    pub user_id: Option<String>,
    pub installation_id: Option<String>,
    pub object: ObjectHandle,
    pub original: Option<ObjectHandle>,
}

#[async_trait]
pub trait Trigger: Send + Sync {
    /// Returning `Some` from a before-save hook replaces the pending data.
    async fn run(&self, request: &TriggerRequest) -> AppResult<Option<Object>>;
}

/// Hook backed by a plain closure.
pub struct FnTrigger<F>(pub F);

#[async_trait]
impl<F> Trigger for FnTrigger<F>
where
    F: Fn(&TriggerRequest) -> AppResult<Option<Object>> + Send + Sync,
{
    async fn run(&self, request: &TriggerRequest) -> AppResult<Option<Object>> { (self.0)(request) }
}

type TriggerKey = (String, String, TriggerKind);

#[derive(Default)]
pub struct TriggerRegistry {
    hooks: RwLock<HashMap<TriggerKey, Arc<dyn Trigger>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self { Self::default() }

    fn key(app_id: &str, class_name: &str, kind: TriggerKind) -> TriggerKey {
        (app_id.to_string(), class_name.to_string(), kind)
    }

    pub fn register(&self, app_id: &str, class_name: &str, kind: TriggerKind, trigger: Arc<dyn Trigger>) {
        debug!(target: "basalt::triggers", "register {} for {}.{}", kind, app_id, class_name);
        self.hooks.write().insert(Self::key(app_id, class_name, kind), trigger);
    }

    pub fn register_fn<F>(&self, app_id: &str, class_name: &str, kind: TriggerKind, f: F)
    where
        F: Fn(&TriggerRequest) -> AppResult<Option<Object>> + Send + Sync + 'static,
    {
        self.register(app_id, class_name, kind, Arc::new(FnTrigger(f)));
    }

    pub fn remove(&self, app_id: &str, class_name: &str, kind: TriggerKind) -> bool {
        self.hooks.write().remove(&Self::key(app_id, class_name, kind)).is_some()
    }

    pub fn trigger_exists(&self, class_name: &str, kind: TriggerKind, app_id: &str) -> bool {
        self.hooks.read().contains_key(&Self::key(app_id, class_name, kind))
    }

    pub fn get(&self, class_name: &str, kind: TriggerKind, app_id: &str) -> Option<Arc<dyn Trigger>> {
        self.hooks.read().get(&Self::key(app_id, class_name, kind)).cloned()
    }

    /// Run the hook for `object`'s class if one is registered.
    pub async fn maybe_run_trigger(
        &self,
        kind: TriggerKind,
        auth: &Auth,
        object: ObjectHandle,
        original: Option<ObjectHandle>,
        app_id: &str,
    ) -> AppResult<Option<Object>> {
        let Some(trigger) = self.get(object.class_name(), kind, app_id) else { return Ok(None); };
        let request = TriggerRequest {
            kind,
            master: auth.is_master,
            user_id: auth.user.as_ref().map(|u| u.id.clone()),
            installation_id: auth.installation_id.clone(),
            object,
            original,
        };
        debug!(target: "basalt::triggers", "run {} on {} ({:?})", kind, request.object.class_name(), request.object.object_id());
        trigger.run(&request).await
    }
}
