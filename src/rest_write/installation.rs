//! `_Installation` identity resolution.
//!
//! A device is identified by its installation id, its push device token, or
//! both. Before writing, the handler looks up rows sharing either identifier
//! and decides whether the write creates a new row, updates an existing one, or
//! merges two rows into one. The decision itself is the pure function
//! [`decide`]; the handler only gathers facts and carries out the resolution.

use serde_json::{json, Value};
use tracing::debug;

use crate::controllers::LogLevel;
use crate::error::{AppError, AppResult, ErrorCode};
use crate::storage::{query_eq, FindOptions, Object};

use super::RestWrite;

const CLASS: &str = "_Installation";

/// What the lookups found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallationFacts {
    /// A row matched by object id (update) or installation id.
    pub id_match: bool,
    /// Rows sharing the request's device token.
    pub device_token_matches: usize,
    /// The only device-token match carries an installation id.
    pub token_match_has_installation_id: bool,
    pub request_has_installation_id: bool,
    /// The request sets a device token different from the id match's.
    pub request_token_differs_from_id_match: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing to reconcile; write as requested.
    Create,
    /// Update the single device-token match.
    AdoptTokenMatch,
    /// Several rows share the token and nothing tells them apart.
    Ambiguous,
    /// Drop token matches owned by other installation ids, then create.
    CleanupThenCreate,
    /// Delete the id match and fold the request into the token-only row.
    MergeIntoTokenMatch,
    /// Update the id match; `cleanup` drops stale rows holding the new token.
    AdoptIdMatch { cleanup: bool },
}

pub fn decide(f: InstallationFacts) -> Resolution {
    match (f.id_match, f.device_token_matches) {
        (false, 0) => Resolution::Create,
        (false, 1) if !f.token_match_has_installation_id || !f.request_has_installation_id => Resolution::AdoptTokenMatch,
        (false, _) if !f.request_has_installation_id => Resolution::Ambiguous,
        (false, _) => Resolution::CleanupThenCreate,
        (true, 1) if !f.token_match_has_installation_id => Resolution::MergeIntoTokenMatch,
        (true, _) => Resolution::AdoptIdMatch { cleanup: f.request_token_differs_from_id_match },
    }
}

fn text<'a>(obj: &'a Object, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn row_id(row: &Object) -> Option<String> {
    text(row, "objectId").map(str::to_string)
}

fn missing(message: &str) -> AppError { AppError::new(ErrorCode::MissingRequiredField, message) }

fn immutable(field: &str) -> AppError {
    AppError::new(ErrorCode::ChangedImmutableField, format!("{} may not be changed in this operation", field))
}

impl RestWrite {
    /// Resolve which installation row this write targets; may turn a create
    /// into an update.
    pub(super) async fn handle_installation(&mut self) -> AppResult<()> {
        if self.response.is_some() || self.class_name != CLASS { return Ok(()); }

        if self.query.is_none() {
            if text(&self.data, "deviceToken").is_none() && text(&self.data, "installationId").is_none() {
                return Err(missing("at least one ID field (deviceToken, installationId) must be specified in this operation"));
            }
            if text(&self.data, "deviceType").is_none() {
                return Err(missing("deviceType must be specified in this operation"));
            }
        }
        self.normalize_installation_ids();

        let device_token = text(&self.data, "deviceToken").map(str::to_string);
        let installation_id = text(&self.data, "installationId").map(str::to_string);
        let db = self.config.database.clone();

        let mut id_match: Option<Object> = None;
        if let Some(target) = self.query_object_id().map(str::to_string) {
            let found = db.find(CLASS, &query_eq("objectId", target), &FindOptions::default()).await?;
            let Some(existing) = found.into_iter().next() else {
                return Err(AppError::not_found("Object not found for update."));
            };
            self.check_immutable_fields(&existing)?;
            id_match = Some(existing);
        }

        if let Some(inst) = &installation_id {
            let found = db.find(CLASS, &query_eq("installationId", inst.as_str()), &FindOptions::default()).await?;
            if let Some(first) = found.into_iter().next() {
                id_match = Some(first);
            }
        }
        let token_matches = match &device_token {
            Some(token) => db.find(CLASS, &query_eq("deviceToken", token.as_str()), &FindOptions::default()).await?,
            None => Vec::new(),
        };

        let facts = InstallationFacts {
            id_match: id_match.is_some(),
            device_token_matches: token_matches.len(),
            token_match_has_installation_id: token_matches.len() == 1 && text(&token_matches[0], "installationId").is_some(),
            request_has_installation_id: installation_id.is_some(),
            request_token_differs_from_id_match: match (&device_token, &id_match) {
                (Some(token), Some(row)) => text(row, "deviceToken") != Some(token.as_str()),
                _ => false,
            },
        };
        let resolution = decide(facts);
        debug!(target: "basalt::rest_write", "installation facts={:?} resolution={:?}", facts, resolution);

        let adopted = match resolution {
            Resolution::Create => None,
            Resolution::AdoptTokenMatch => token_matches.first().and_then(row_id),
            Resolution::Ambiguous => {
                return Err(AppError::new(
                    ErrorCode::InvalidInstallationId,
                    "Must specify installationId when deviceToken matches multiple Installation objects",
                ));
            }
            Resolution::CleanupThenCreate => {
                self.destroy_stale_token_rows(None);
                None
            }
            Resolution::MergeIntoTokenMatch => {
                let keep = token_matches.first().and_then(row_id);
                if let Some(id) = id_match.as_ref().and_then(row_id).filter(|id| Some(id) != keep.as_ref()) {
                    db.destroy(CLASS, &query_eq("objectId", id)).await?;
                }
                keep
            }
            Resolution::AdoptIdMatch { cleanup } => {
                let keep = id_match.as_ref().and_then(row_id);
                if cleanup { self.destroy_stale_token_rows(id_match.as_ref().zip(keep.as_deref())); }
                keep
            }
        };

        if let Some(id) = adopted {
            self.query = Some(query_eq("objectId", id));
            self.data.remove("objectId");
            self.data.remove("createdAt");
        }
        Ok(())
    }

    /// iOS tokens (64 chars) and installation ids compare case-insensitively.
    fn normalize_installation_ids(&mut self) {
        if let Some(Value::String(token)) = self.data.get_mut("deviceToken") {
            if token.len() == 64 { *token = token.to_lowercase(); }
        }
        if let Some(Value::String(inst)) = self.data.get_mut("installationId") {
            *inst = inst.to_lowercase();
        }
    }

    fn check_immutable_fields(&self, existing: &Object) -> AppResult<()> {
        let requested_inst = text(&self.data, "installationId");
        let stored_inst = text(existing, "installationId");
        if let (Some(req), Some(stored)) = (requested_inst, stored_inst) {
            if req != stored { return Err(immutable("installationId")); }
        }
        if let (Some(req), Some(stored)) = (text(&self.data, "deviceToken"), text(existing, "deviceToken")) {
            if req != stored && requested_inst.is_none() && stored_inst.is_none() {
                return Err(immutable("deviceToken"));
            }
        }
        if let Some(req) = text(&self.data, "deviceType") {
            if Some(req) != text(existing, "deviceType") { return Err(immutable("deviceType")); }
        }
        Ok(())
    }

    /// Detached removal of rows holding this request's device token under a
    /// different installation id (scoped to the app identifier when given).
    /// `keep` is the row being written, which never counts as stale.
    fn destroy_stale_token_rows(&self, keep: Option<(&Object, &str)>) {
        let Some(token) = text(&self.data, "deviceToken") else { return; };
        let mut query = query_eq("deviceToken", token);
        let inst = text(&self.data, "installationId")
            .or_else(|| keep.and_then(|(row, _)| text(row, "installationId")))
            .map_or(Value::Null, |s| Value::String(s.to_string()));
        query.insert("installationId".into(), json!({ "$ne": inst }));
        if let Some((_, id)) = keep {
            query.insert("objectId".into(), json!({ "$ne": id }));
        }
        if let Some(app) = text(&self.data, "appIdentifier") {
            query.insert("appIdentifier".into(), Value::String(app.to_string()));
        }
        let db = self.config.database.clone();
        let logger = self.config.logger.clone();
        tokio::spawn(async move {
            if let Err(e) = db.destroy(CLASS, &query).await {
                logger.log(LogLevel::Warn, &format!("installation cleanup failed: {}", e));
            }
        });
    }
}
