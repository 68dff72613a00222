use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::Config;
use crate::error::{AppError, AppResult, ErrorCode};
use crate::storage::{query_eq, FindOptions};
use crate::tprintln;

use super::Auth;

fn invalid_token() -> AppError { AppError::new(ErrorCode::InvalidSessionToken, "invalid session token") }

/// Resolve a `_Session` token into the `Auth` of the user it belongs to.
/// Unknown or expired tokens are rejected.
pub async fn auth_for_session_token(config: &Config, token: &str, installation_id: Option<String>) -> AppResult<Auth> {
    let rows = config.database.find("_Session", &query_eq("sessionToken", token), &FindOptions::limit(1)).await?;
    let Some(session) = rows.into_iter().next() else {
        tprintln!("session lookup miss app={}", config.application_id());
        return Err(invalid_token());
    };
    if let Some(iso) = session.get("expiresAt").and_then(|v| v.get("iso")).and_then(|v| v.as_str()) {
        let expires = DateTime::parse_from_rfc3339(iso).map_err(|_| invalid_token())?;
        if expires.with_timezone(&Utc) <= Utc::now() {
            debug!(target: "basalt::auth", "session expired at {}", iso);
            return Err(invalid_token());
        }
    }
    let user_id = session
        .get("user")
        .and_then(|u| u.get("objectId"))
        .and_then(|v| v.as_str())
        .ok_or_else(invalid_token)?;
    Ok(Auth::for_user(config, user_id).with_installation_id(installation_id))
}
