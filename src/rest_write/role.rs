use crate::error::{AppError, AppResult, ErrorCode};

use super::RestWrite;

impl RestWrite {
    /// New `_Role` objects need a signed-in creator and a name.
    pub(super) fn handle_role(&self) -> AppResult<()> {
        if self.response.is_some() || self.class_name != "_Role" || self.query.is_some() { return Ok(()); }

        if self.auth.user.is_none() && !self.auth.is_master {
            return Err(AppError::session_required());
        }
        let named = self.data.get("name").and_then(|v| v.as_str()).map(|s| !s.is_empty()).unwrap_or(false);
        if !named {
            return Err(AppError::new(ErrorCode::InvalidRoleName, "Invalid role name."));
        }
        Ok(())
    }
}
