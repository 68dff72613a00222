use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// Verifies one provider's credential payload (e.g. `{"id": .., "access_token": ..}`).
#[async_trait]
pub trait AuthDataValidator: Send + Sync {
    async fn validate(&self, auth_data: &Value) -> AppResult<()>;
}

/// Anonymous users only need a client generated id.
#[derive(Debug, Clone, Default)]
pub struct AnonymousValidator;

#[async_trait]
impl AuthDataValidator for AnonymousValidator {
    async fn validate(&self, auth_data: &Value) -> AppResult<()> {
        match auth_data.get("id").and_then(|v| v.as_str()) {
            Some(id) if !id.is_empty() => Ok(()),
            _ => Err(AppError::unsupported_service()),
        }
    }
}

/// Adapter turning a synchronous closure into a validator.
pub struct FnValidator<F>(pub F);

#[async_trait]
impl<F> AuthDataValidator for FnValidator<F>
where
    F: Fn(&Value) -> AppResult<()> + Send + Sync,
{
    async fn validate(&self, auth_data: &Value) -> AppResult<()> { (self.0)(auth_data) }
}

/// Registry of auth-provider validators, looked up by provider name.
pub struct AuthDataManager {
    validators: RwLock<HashMap<String, Arc<dyn AuthDataValidator>>>,
}

impl Default for AuthDataManager {
    fn default() -> Self {
        let m = Self { validators: RwLock::new(HashMap::new()) };
        m.register("anonymous", Arc::new(AnonymousValidator));
        m
    }
}

impl AuthDataManager {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, provider: &str, validator: Arc<dyn AuthDataValidator>) {
        self.validators.write().insert(provider.to_string(), validator);
    }

    pub fn get_validator_for_provider(&self, provider: &str) -> Option<Arc<dyn AuthDataValidator>> {
        self.validators.read().get(provider).cloned()
    }
}
