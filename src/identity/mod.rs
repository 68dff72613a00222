//! Caller identity for the write pipeline: master override, authenticated user
//! or anonymous, plus the lazily resolved role set.
//! Keep the public surface thin and split implementation across sub-modules.

mod auth;
mod session;

pub use auth::{Auth, AuthUser};
pub use session::auth_for_session_token;
