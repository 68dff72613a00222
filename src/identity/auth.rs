use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::Config;
use crate::error::AppResult;
use crate::storage::{pointer, query_eq, FindOptions, SharedDatabase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
}

/// Who is performing a write.
#[derive(Clone)]
pub struct Auth {
    pub is_master: bool,
    pub user: Option<AuthUser>,
    /// Installation id sent by the client, if any.
    pub installation_id: Option<String>,
    database: Option<SharedDatabase>,
    roles: Arc<OnceCell<Vec<String>>>,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("is_master", &self.is_master)
            .field("user", &self.user)
            .field("installation_id", &self.installation_id)
            .finish()
    }
}

impl Auth {
    fn build(config: &Config, is_master: bool, user: Option<AuthUser>) -> Self {
        Self {
            is_master,
            user,
            installation_id: None,
            database: Some(config.database.clone()),
            roles: Arc::new(OnceCell::new()),
        }
    }

    pub fn master(config: &Config) -> Self { Self::build(config, true, None) }

    pub fn nobody(config: &Config) -> Self { Self::build(config, false, None) }

    pub fn for_user(config: &Config, user_id: impl Into<String>) -> Self {
        Self::build(config, false, Some(AuthUser { id: user_id.into() }))
    }

    pub fn with_installation_id(mut self, installation_id: Option<String>) -> Self {
        self.installation_id = installation_id;
        self
    }

    /// Master may touch any user; others only themselves.
    pub fn could_update_user_id(&self, user_id: &str) -> bool {
        if self.is_master { return true; }
        self.user.as_ref().map(|u| u.id == user_id).unwrap_or(false)
    }

    /// Names of every role the current user belongs to, directly or through
    /// role inheritance, as `role:<name>` entries. Resolved once per `Auth`.
    pub async fn get_user_roles(&self) -> AppResult<Vec<String>> {
        if self.is_master { return Ok(Vec::new()); }
        let (Some(user), Some(db)) = (self.user.as_ref(), self.database.as_ref()) else { return Ok(Vec::new()); };
        let roles = self.roles.get_or_try_init(|| resolve_roles(db.clone(), user.id.clone())).await?;
        Ok(roles.clone())
    }
}

async fn resolve_roles(db: SharedDatabase, user_id: String) -> AppResult<Vec<String>> {
    let direct = db.find("_Role", &query_eq("users", pointer("_User", &user_id)), &FindOptions::default()).await?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut names: Vec<String> = Vec::new();
    let mut frontier: Vec<String> = Vec::new();
    let mut absorb = |rows: Vec<crate::storage::Object>, frontier: &mut Vec<String>| {
        for row in rows {
            let Some(id) = row.get("objectId").and_then(|v| v.as_str()) else { continue; };
            if !seen.insert(id.to_string()) { continue; }
            if let Some(name) = row.get("name").and_then(|v| v.as_str()) {
                names.push(format!("role:{}", name));
            }
            frontier.push(id.to_string());
        }
    };
    absorb(direct, &mut frontier);
    // Parent roles list their children in `roles`
    while let Some(role_id) = frontier.pop() {
        let parents = db.find("_Role", &query_eq("roles", pointer("_Role", &role_id)), &FindOptions::default()).await?;
        absorb(parents, &mut frontier);
    }
    debug!(target: "basalt::auth", "resolved {} role(s) for user {}", names.len(), user_id);
    Ok(names)
}
