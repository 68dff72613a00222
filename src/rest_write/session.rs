use chrono::{Months, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::identity::Auth;
use crate::storage::{date, pointer, Object};

use super::{RestWrite, WriteResponse};

/// Session expiry: one year after now.
pub(super) fn one_year_from_now() -> AppResult<Value> {
    let expires = Utc::now()
        .checked_add_months(Months::new(12))
        .ok_or_else(|| AppError::internal("session expiry out of range"))?;
    Ok(date(&expires.to_rfc3339_opts(SecondsFormat::Millis, true)))
}

impl RestWrite {
    /// `_Session` writes: only users or master, never with an ACL. A client
    /// create is materialized as a restricted session through a master write.
    pub(super) async fn handle_session(&mut self) -> AppResult<()> {
        if self.response.is_some() || self.class_name != "_Session" { return Ok(()); }

        if self.auth.user.is_none() && !self.auth.is_master {
            return Err(AppError::session_required());
        }
        if self.data.contains_key("ACL") {
            return Err(AppError::invalid_key("Cannot set ACL on a Session."));
        }
        if self.query.is_some() || self.auth.is_master { return Ok(()); }

        let user_id = self.auth.user.as_ref().map(|u| u.id.clone()).unwrap_or_default();
        let mut session = Object::new();
        session.insert("sessionToken".into(), Value::String(format!("r:{}", crypto::new_token()?)));
        session.insert("user".into(), pointer("_User", &user_id));
        session.insert("createdWith".into(), json!({ "action": "create" }));
        session.insert("restricted".into(), Value::Bool(true));
        session.insert("expiresAt".into(), one_year_from_now()?);
        for (key, value) in self.data.iter() {
            if key == "objectId" { continue; }
            session.insert(key.clone(), value.clone());
        }

        let master = Auth::master(&self.config);
        let nested = RestWrite::new(self.config.clone(), master, "_Session", None, session.clone(), None)?;
        let result = nested.execute().await?;
        let Some(created) = result.response else {
            return Err(AppError::internal("Error creating session."));
        };
        session.insert("objectId".into(), created.get("objectId").cloned().unwrap_or(Value::Null));
        self.response = Some(WriteResponse { response: Some(session), status: Some(201), location: result.location });
        Ok(())
    }
}
