use futures_util::future::{try_join_all, BoxFuture};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::crypto;
use crate::error::{AppError, AppResult, ErrorCode};
use crate::identity::Auth;
use crate::storage::{pointer, FindOptions, Object};

use super::session::one_year_from_now;
use super::{RestWrite, WriteResponse};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.+@.+$").expect("static regex"));

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn truthy_field<'a>(obj: &'a Object, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| is_truthy(v))
}

impl RestWrite {
    /// Credentials check for `_User` writes and third-party auth linking.
    pub(super) async fn validate_auth_data(&mut self) -> AppResult<()> {
        if self.class_name != "_User" { return Ok(()); }

        let auth_data = self.data.get("authData").cloned();
        if self.query.is_none() && matches!(auth_data, None | Some(Value::Null)) {
            if !matches!(self.data.get("username"), Some(Value::String(_))) {
                return Err(AppError::new(ErrorCode::UsernameMissing, "bad or missing username"));
            }
            if !matches!(self.data.get("password"), Some(Value::String(_))) {
                return Err(AppError::new(ErrorCode::PasswordMissing, "password is required"));
            }
        }

        let auth_data = match auth_data {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::Object(map)) if map.is_empty() => return Ok(()),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(AppError::unsupported_service()),
        };

        let can_handle = auth_data.values().all(|provider_data| match provider_data {
            Value::Null => true,
            other => other.get("id").map(is_truthy).unwrap_or(false),
        });
        if !can_handle { return Err(AppError::unsupported_service()); }
        self.handle_auth_data(auth_data).await
    }

    async fn handle_auth_data_validation(&self, auth_data: &Object) -> AppResult<()> {
        let mut validations: Vec<BoxFuture<'static, AppResult<()>>> = Vec::new();
        for (provider, provider_data) in auth_data.iter() {
            if provider_data.is_null() { continue; }
            let validator = self
                .config
                .auth_data_manager
                .get_validator_for_provider(provider)
                .ok_or_else(AppError::unsupported_service)?;
            let provider_data = provider_data.clone();
            validations.push(Box::pin(async move { validator.validate(&provider_data).await }));
        }
        try_join_all(validations).await?;
        Ok(())
    }

    async fn find_users_with_auth_data(&self, auth_data: &Object) -> AppResult<Vec<Object>> {
        let clauses: Vec<Value> = auth_data
            .iter()
            .filter_map(|(provider, provider_data)| {
                let id = provider_data.get("id")?;
                let mut clause = Object::new();
                clause.insert(format!("authData.{}.id", provider), id.clone());
                Some(Value::Object(clause))
            })
            .collect();
        if clauses.is_empty() { return Ok(Vec::new()); }
        let mut query = Object::new();
        query.insert("$or".into(), Value::Array(clauses));
        self.config.database.find(&self.class_name, &query, &FindOptions::default()).await
    }

    /// Links `auth_data` to an account. A create matching exactly one existing
    /// account logs into it instead of creating a new one. An update carrying
    /// auth data that belongs to a different account is rejected; it never
    /// turns into a login.
    async fn handle_auth_data(&mut self, auth_data: Object) -> AppResult<()> {
        self.handle_auth_data_validation(&auth_data).await?;
        let mut results = self.find_users_with_auth_data(&auth_data).await?;
        if results.len() > 1 {
            return Err(AppError::account_already_linked());
        }

        self.storage.auth_provider = Some(auth_data.keys().cloned().collect::<Vec<_>>().join(","));

        let Some(mut existing) = results.pop() else {
            self.data.insert("username".into(), Value::String(crypto::new_token()?));
            return Ok(());
        };
        let existing_id = existing.get("objectId").and_then(|v| v.as_str()).unwrap_or_default().to_string();

        if self.query.is_none() {
            debug!(target: "basalt::rest_write", "auth data login for user {}", existing_id);
            existing.remove("password");
            existing.retain(|key, _| !key.starts_with('_'));
            self.data.insert("objectId".into(), Value::String(existing_id));
            let location = self.location();
            self.response = Some(WriteResponse { response: Some(existing), status: None, location: Some(location) });
        } else if self.query_object_id().is_some_and(|target| target != existing_id) {
            return Err(AppError::account_already_linked());
        }
        Ok(())
    }

    /// Session issuance, password hashing and username/email uniqueness.
    pub(super) async fn transform_user(&mut self) -> AppResult<()> {
        if self.class_name != "_User" { return Ok(()); }

        if self.query.is_none() {
            let token = format!("r:{}", crypto::new_token()?);
            self.storage.token = Some(token.clone());
            let installation_id = self
                .data
                .get("installationId")
                .cloned()
                .or_else(|| self.auth.installation_id.clone().map(Value::String));
            let mut session = Object::new();
            session.insert("sessionToken".into(), Value::String(token.clone()));
            session.insert("user".into(), pointer("_User", &self.object_id()));
            session.insert("createdWith".into(), json!({
                "action": "login",
                "authProvider": self.storage.auth_provider.clone().unwrap_or_else(|| "password".to_string()),
            }));
            session.insert("restricted".into(), Value::Bool(false));
            if let Some(id) = installation_id {
                session.insert("installationId".into(), id);
            }
            session.insert("expiresAt".into(), one_year_from_now()?);

            if let Some(WriteResponse { response: Some(resp), .. }) = self.response.as_mut() {
                resp.insert("sessionToken".into(), Value::String(token));
            }
            let master = Auth::master(&self.config);
            RestWrite::new(self.config.clone(), master, "_Session", None, session, None)?.execute().await?;
        }

        let password = match self.data.get("password") {
            None | Some(Value::Null) => None,
            Some(Value::String(p)) => Some(p.clone()),
            Some(_) => return Err(AppError::new(ErrorCode::PasswordMissing, "password must be a string")),
        };
        if let Some(password) = password {
            if self.query.is_some() && !self.auth.is_master {
                self.storage.clear_sessions = true;
            }
            let hashed = crypto::hash_password(&password)?;
            self.data.insert("_hashed_password".into(), Value::String(hashed));
            self.data.remove("password");
        }

        match truthy_field(&self.data, "username").cloned() {
            None => {
                if self.query.is_none() {
                    self.data.insert("username".into(), Value::String(crypto::random_string(25)?));
                }
            }
            Some(username) => {
                if self.exists_elsewhere("username", username).await? {
                    return Err(AppError::new(ErrorCode::UsernameTaken, "Account already exists for this username"));
                }
            }
        }

        let Some(email) = truthy_field(&self.data, "email").cloned() else { return Ok(()); };
        if !email.as_str().map(|e| EMAIL_RE.is_match(e)).unwrap_or(false) {
            return Err(AppError::new(ErrorCode::InvalidEmailAddress, "Email address format is invalid."));
        }
        if self.exists_elsewhere("email", email).await? {
            return Err(AppError::new(ErrorCode::EmailTaken, "Account already exists for this email address"));
        }
        self.storage.send_verification_email = true;
        self.config.user_controller.set_email_verify_token(&mut self.data);
        Ok(())
    }

    /// Whether another user already holds `value` in `field`.
    async fn exists_elsewhere(&self, field: &str, value: Value) -> AppResult<bool> {
        let mut query = Object::new();
        query.insert(field.to_string(), value);
        query.insert("objectId".into(), json!({ "$ne": self.object_id() }));
        let found = self.config.database.find(&self.class_name, &query, &FindOptions::limit(1)).await?;
        Ok(!found.is_empty())
    }
}
