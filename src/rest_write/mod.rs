//!
//! basalt write pipeline
//! ---------------------
//! A `RestWrite` carries one create or update from the REST surface to the
//! database. `query == None` means create; otherwise the object matching the
//! query is updated with `data`.
//!
//! Stages run strictly in order and the first failure aborts the write:
//! ACL/roles, client class creation, schema, installation, session, role,
//! auth data, before-save trigger, required fields, user transformation, file
//! expansion of a short-circuited response, database write, followup and the
//! detached after-save trigger.
//!
//! Some stages create other objects (e.g. the session issued to a new user)
//! by building and executing a nested `RestWrite`. Nested writes are not rolled
//! back when a later stage of the outer write fails.
//!
//! Special classes are handled in submodules: `user` (`_User`), `session`
//! (`_Session`), `installation` (`_Installation`) and `role` (`_Role`).

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::controllers::LogLevel;
use crate::crypto;
use crate::error::{AppError, AppResult, ErrorCode};
use crate::identity::Auth;
use crate::storage::schema::SYSTEM_CLASSES;
use crate::storage::{pointer, query_eq, FindOptions, Object, RunOptions};
use crate::triggers::{inflate, InflateExtra, TriggerKind};

mod installation;
mod role;
mod session;
mod user;

pub use installation::{decide, InstallationFacts, Resolution};

/// Outcome of a write: payload, HTTP status and `Location` header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResponse {
    pub response: Option<Object>,
    pub status: Option<u16>,
    pub location: Option<String>,
}

impl WriteResponse {
    pub fn status_code(&self) -> u16 { self.status.unwrap_or(200) }
}

/// Flags passed from one stage to a later one.
#[derive(Debug, Clone, Default)]
struct WriteStorage {
    changed_by_trigger: bool,
    clear_sessions: bool,
    send_verification_email: bool,
    auth_provider: Option<String>,
    token: Option<String>,
}

pub struct RestWrite {
    config: Arc<Config>,
    auth: Auth,
    class_name: String,
    query: Option<Object>,
    data: Object,
    original_data: Option<Object>,
    run_options: RunOptions,
    storage: WriteStorage,
    response: Option<WriteResponse>,
    /// Timestamp shared by every field this write stamps.
    updated_at: String,
}

fn now_iso() -> String { Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true) }

fn str_field<'a>(obj: &'a Object, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

impl RestWrite {
    pub fn new(
        config: Arc<Config>,
        auth: Auth,
        class_name: impl Into<String>,
        query: Option<Object>,
        data: Object,
        original_data: Option<Object>,
    ) -> AppResult<Self> {
        if !config.is_valid() {
            return Err(AppError::internal(format!("unknown application {}", config.application_id())));
        }
        if query.is_none() && data.contains_key("objectId") {
            return Err(AppError::invalid_key("objectId is an invalid field name."));
        }
        Ok(Self {
            config,
            auth,
            class_name: class_name.into(),
            query,
            data,
            original_data,
            run_options: RunOptions::default(),
            storage: WriteStorage::default(),
            response: None,
            updated_at: now_iso(),
        })
    }

    /// Run every stage and return the accumulated response.
    pub fn execute(self) -> BoxFuture<'static, AppResult<WriteResponse>> { Box::pin(self.run()) }

    async fn run(mut self) -> AppResult<WriteResponse> {
        debug!(target: "basalt::rest_write", "{} {} (master={})",
            if self.query.is_some() { "update" } else { "create" }, self.class_name, self.auth.is_master);
        self.get_user_and_role_acl().await?;
        self.validate_client_class_creation().await?;
        self.validate_schema().await?;
        self.handle_installation().await?;
        self.handle_session().await?;
        self.handle_role()?;
        self.validate_auth_data().await?;
        self.run_before_trigger().await?;
        self.set_required_fields_if_needed()?;
        self.transform_user().await?;
        self.expand_files_for_existing_objects();
        self.run_database_operation().await?;
        self.handle_followup();
        self.run_after_trigger();
        Ok(self.response.unwrap_or_default())
    }

    async fn get_user_and_role_acl(&mut self) -> AppResult<()> {
        if self.auth.is_master { return Ok(()); }
        let mut acl = vec!["*".to_string()];
        if let Some(user) = self.auth.user.clone() {
            acl.extend(self.auth.get_user_roles().await?);
            acl.push(user.id);
        }
        self.run_options.acl = Some(acl);
        Ok(())
    }

    async fn validate_client_class_creation(&self) -> AppResult<()> {
        if self.config.settings.allow_client_class_creation
            || self.auth.is_master
            || SYSTEM_CLASSES.contains(&self.class_name.as_str())
        {
            return Ok(());
        }
        if self.config.database.collection_exists(&self.class_name).await? { return Ok(()); }
        Err(AppError::forbidden(format!("This user is not allowed to access non-existent class: {}", self.class_name)))
    }

    async fn validate_schema(&self) -> AppResult<()> {
        self.config.database.validate_object(&self.class_name, &self.data, self.query.as_ref(), &self.run_options).await
    }

    fn inflate_extra(&self) -> InflateExtra {
        InflateExtra { class_name: self.class_name.clone(), object_id: self.query_object_id().map(str::to_string) }
    }

    async fn run_before_trigger(&mut self) -> AppResult<()> {
        if self.response.is_some() { return Ok(()); }
        let app_id = self.config.application_id().to_string();
        if !self.config.triggers.trigger_exists(&self.class_name, TriggerKind::BeforeSave, &app_id) { return Ok(()); }

        let extra = self.inflate_extra();
        let original = self.query_object_id().map(|_| inflate(&extra, self.original_data.as_ref()));
        let mut updated = inflate(&extra, self.original_data.as_ref());
        updated.set(&self.data);

        let replacement = self.config.triggers
            .maybe_run_trigger(TriggerKind::BeforeSave, &self.auth, updated, original, &app_id)
            .await?;
        if let Some(mut object) = replacement {
            object.remove("className");
            if self.query_object_id().is_some() {
                object.remove("objectId");
            }
            self.data = object;
            self.storage.changed_by_trigger = true;
        }
        Ok(())
    }

    fn set_required_fields_if_needed(&mut self) -> AppResult<()> {
        self.data.insert("updatedAt".into(), Value::String(self.updated_at.clone()));
        if self.query.is_none() {
            self.data.insert("createdAt".into(), Value::String(self.updated_at.clone()));
            if !self.data.contains_key("objectId") {
                self.data.insert("objectId".into(), Value::String(crypto::new_object_id()?));
            }
        } else {
            self.data.remove("objectId");
        }
        Ok(())
    }

    /// A short-circuited response never went through the database, so its file
    /// references still lack URLs.
    fn expand_files_for_existing_objects(&mut self) {
        if let Some(WriteResponse { response: Some(resp), .. }) = self.response.as_mut() {
            self.config.files.expand_files_in_object(&self.config, resp);
        }
    }

    async fn run_database_operation(&mut self) -> AppResult<()> {
        if self.response.is_some() { return Ok(()); }

        if self.class_name == "_User" && self.query.is_some() {
            let target = self.query_object_id().unwrap_or_default();
            if !self.auth.could_update_user_id(target) {
                return Err(AppError::new(ErrorCode::SessionMissing, format!("cannot modify user {}", target)));
            }
        }

        if self.class_name == "_Product" {
            if let Some(name) = self.data.get("download").and_then(|d| d.get("name")).cloned() {
                self.data.insert("downloadName".into(), name);
            }
        }

        if self.data.get("ACL").and_then(|acl| acl.get("*unresolved")).is_some() {
            return Err(AppError::new(ErrorCode::InvalidAcl, "Invalid ACL."));
        }

        let db = self.config.database.clone();
        if let Some(query) = &self.query {
            let mut resp = db.update(&self.class_name, query, &self.data, &self.run_options).await?;
            resp.insert("updatedAt".into(), Value::String(self.updated_at.clone()));
            self.response = Some(WriteResponse { response: Some(resp), status: None, location: None });
            return Ok(());
        }

        if self.class_name == "_User" && !self.data.contains_key("ACL") {
            let owner = self.object_id();
            let mut acl = Object::new();
            acl.insert(owner, json!({ "read": true, "write": true }));
            acl.insert("*".into(), json!({ "read": true, "write": false }));
            self.data.insert("ACL".into(), Value::Object(acl));
        }

        db.create(&self.class_name, &self.data, &self.run_options).await?;

        let mut resp = Object::new();
        resp.insert("objectId".into(), Value::String(self.object_id()));
        resp.insert("createdAt".into(), self.data.get("createdAt").cloned().unwrap_or(Value::Null));
        if self.storage.changed_by_trigger {
            for (key, value) in self.data.iter() {
                // Internal fields such as `_hashed_password` stay server side
                if key.starts_with('_') { continue; }
                resp.insert(key.clone(), value.clone());
            }
        }
        if let Some(token) = &self.storage.token {
            resp.insert("sessionToken".into(), Value::String(token.clone()));
        }
        self.response = Some(WriteResponse { response: Some(resp), status: Some(201), location: Some(self.location()) });
        Ok(())
    }

    /// Detached side effects of a completed write.
    fn handle_followup(&mut self) {
        if self.storage.clear_sessions {
            self.storage.clear_sessions = false;
            let db = self.config.database.clone();
            let logger = self.config.logger.clone();
            let user_id = self.object_id();
            let query = query_eq("user", pointer("_User", &user_id));
            tokio::spawn(async move {
                if let Err(e) = db.destroy("_Session", &query).await {
                    logger.log(LogLevel::Error, &format!("clearing sessions of user {} failed: {}", user_id, e));
                }
            });
            self.handle_followup();
        }

        if self.storage.send_verification_email {
            self.storage.send_verification_email = false;
            let controller = self.config.user_controller.clone();
            let logger = self.config.logger.clone();
            let user = self.data.clone();
            tokio::spawn(async move {
                if let Err(e) = controller.send_verification_email(user).await {
                    logger.log(LogLevel::Error, &format!("verification email failed: {}", e));
                }
            });
        }
    }

    /// Runs the after-save hook without waiting for it.
    fn run_after_trigger(&self) {
        let Some(WriteResponse { response: Some(resp), status, .. }) = self.response.as_ref() else { return; };
        let app_id = self.config.application_id().to_string();
        if !self.config.triggers.trigger_exists(&self.class_name, TriggerKind::AfterSave, &app_id) { return; }

        let extra = self.inflate_extra();
        let original = self.query_object_id().map(|_| inflate(&extra, self.original_data.as_ref()));
        let mut updated = inflate(&extra, self.original_data.as_ref());
        updated.set(&self.data);
        updated.handle_save_response(resp, status.unwrap_or(200));

        let triggers = self.config.triggers.clone();
        let logger = self.config.logger.clone();
        let auth = self.auth.clone();
        let class_name = self.class_name.clone();
        tokio::spawn(async move {
            if let Err(e) = triggers.maybe_run_trigger(TriggerKind::AfterSave, &auth, updated, original, &app_id).await {
                warn!(target: "basalt::rest_write", "afterSave for {} failed: {}", class_name, e);
                logger.log(LogLevel::Error, &format!("afterSave failed for {}: {}", class_name, e));
            }
        });
    }

    /// URL of the object this write targets.
    pub fn location(&self) -> String {
        let id = str_field(&self.data, "objectId").unwrap_or_default();
        if self.class_name == "_User" {
            format!("{}/users/{}", self.config.mount, id)
        } else {
            format!("{}/classes/{}/{}", self.config.mount, self.class_name, id)
        }
    }

    /// Id of the target object, from the data on create or the query on update.
    pub fn object_id(&self) -> String {
        str_field(&self.data, "objectId").or_else(|| self.query_object_id()).unwrap_or_default().to_string()
    }

    fn query_object_id(&self) -> Option<&str> {
        self.query.as_ref().and_then(|q| str_field(q, "objectId"))
    }
}

/// Create a new object of `class_name`.
pub async fn create(config: Arc<Config>, auth: Auth, class_name: &str, data: Object) -> AppResult<WriteResponse> {
    RestWrite::new(config, auth, class_name, None, data, None)?.execute().await
}

/// Update the object `object_id` of `class_name`. The stored object is loaded
/// first so triggers can see the original.
pub async fn update(config: Arc<Config>, auth: Auth, class_name: &str, object_id: &str, data: Object) -> AppResult<WriteResponse> {
    let query = query_eq("objectId", object_id);
    let original = config.database.find(class_name, &query, &FindOptions::limit(1)).await?.into_iter().next();
    RestWrite::new(config, auth, class_name, Some(query), data, original)?.execute().await
}
