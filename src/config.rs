//! Per-application configuration.
//!
//! `AppSettings` is the serializable part (keys, URLs, feature flags) and can be
//! loaded from a JSON file. `AppHandles` carries the runtime collaborators
//! (database, triggers, controllers). Both are registered once in an `AppCache`,
//! which the HTTP layer consults per request to build a `Config`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::controllers::{
    AuthDataManager, DefaultFilesController, DefaultUserController, EmailOptions, FilesController, LoggerController,
    LoggingMailAdapter, LoggingPushController, MailAdapter, PushController, TracingLogger, UserController,
};
use crate::storage::{MemoryDatabase, SharedDatabase};
use crate::triggers::TriggerRegistry;

/// Per-app overrides for the hosted HTML pages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CustomPages {
    #[serde(default)]
    pub invalid_link: Option<String>,
    #[serde(default)]
    pub verify_email_success: Option<String>,
    #[serde(default)]
    pub choose_password: Option<String>,
    #[serde(default)]
    pub password_reset_success: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub app_id: String,
    pub master_key: String,
    #[serde(default)]
    pub client_key: Option<String>,
    #[serde(default)]
    pub javascript_key: Option<String>,
    #[serde(default)]
    pub dot_net_key: Option<String>,
    #[serde(default)]
    pub rest_api_key: Option<String>,
    #[serde(default)]
    pub file_key: Option<String>,
    #[serde(default)]
    pub facebook_app_ids: Vec<String>,
    /// When false, clients may only write to classes that already exist.
    #[serde(default = "AppSettings::default_allow_client_class_creation")]
    pub allow_client_class_creation: bool,
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub public_server_url: Option<String>,
    #[serde(default)]
    pub verify_user_emails: bool,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub custom_pages: CustomPages,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            master_key: String::new(),
            client_key: None,
            javascript_key: None,
            dot_net_key: None,
            rest_api_key: None,
            file_key: None,
            facebook_app_ids: Vec::new(),
            allow_client_class_creation: Self::default_allow_client_class_creation(),
            server_url: String::new(),
            public_server_url: None,
            verify_user_emails: false,
            app_name: None,
            custom_pages: CustomPages::default(),
        }
    }
}

impl AppSettings {
    fn default_allow_client_class_creation() -> bool { true }

    pub fn new(app_id: impl Into<String>, master_key: impl Into<String>) -> Self {
        Self { app_id: app_id.into(), master_key: master_key.into(), ..Default::default() }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading app settings from {}", path.display()))?;
        let settings: AppSettings = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing app settings in {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Email verification needs a name to sign the mail with and a public URL to link to.
    pub fn validate(&self) -> Result<()> {
        if self.app_id.trim().is_empty() { bail!("An application id is required."); }
        if self.verify_user_emails {
            if self.app_name.is_none() { bail!("An app name is required when using email verification."); }
            if self.public_server_url.is_none() { bail!("A public server url is required when using email verification."); }
        }
        Ok(())
    }

    fn public_url(&self) -> &str {
        self.public_server_url.as_deref().unwrap_or(self.server_url.as_str()).trim_end_matches('/')
    }

    pub fn invalid_link_url(&self) -> String {
        self.custom_pages.invalid_link.clone().unwrap_or_else(|| format!("{}/apps/invalid_link.html", self.public_url()))
    }

    pub fn verify_email_success_url(&self) -> String {
        self.custom_pages.verify_email_success.clone()
            .unwrap_or_else(|| format!("{}/apps/verify_email_success.html", self.public_url()))
    }

    pub fn choose_password_url(&self) -> String {
        self.custom_pages.choose_password.clone().unwrap_or_else(|| format!("{}/apps/choose_password", self.public_url()))
    }

    pub fn request_reset_password_url(&self) -> String {
        format!("{}/apps/{}/request_password_reset", self.public_url(), self.app_id)
    }

    pub fn password_reset_success_url(&self) -> String {
        self.custom_pages.password_reset_success.clone()
            .unwrap_or_else(|| format!("{}/apps/password_reset_success.html", self.public_url()))
    }

    pub fn verify_email_url(&self) -> String {
        format!("{}/apps/{}/verify_email", self.public_url(), self.app_id)
    }
}

/// Runtime collaborators of one application.
#[derive(Clone)]
pub struct AppHandles {
    pub database: SharedDatabase,
    /// Hooks controller: before/after save triggers.
    pub triggers: Arc<TriggerRegistry>,
    pub files: Arc<dyn FilesController>,
    pub push: Arc<dyn PushController>,
    pub logger: Arc<dyn LoggerController>,
    pub user_controller: Arc<dyn UserController>,
    pub auth_data_manager: Arc<AuthDataManager>,
}

impl AppHandles {
    /// Default collaborators for `settings` on top of `database`.
    pub fn for_settings(settings: &AppSettings, database: SharedDatabase) -> Self {
        Self::with_mail(settings, database, Arc::new(LoggingMailAdapter::new()))
    }

    pub fn with_mail(settings: &AppSettings, database: SharedDatabase, mail: Arc<dyn MailAdapter>) -> Self {
        let email = EmailOptions {
            verify_user_emails: settings.verify_user_emails,
            app_name: settings.app_name.clone().unwrap_or_default(),
            verify_email_url: settings.verify_email_url(),
        };
        Self {
            database,
            triggers: Arc::new(TriggerRegistry::new()),
            files: Arc::new(DefaultFilesController),
            push: Arc::new(LoggingPushController::new()),
            logger: Arc::new(TracingLogger),
            user_controller: Arc::new(DefaultUserController::new(email, mail)),
            auth_data_manager: Arc::new(AuthDataManager::new()),
        }
    }
}

impl Default for AppHandles {
    fn default() -> Self { Self::for_settings(&AppSettings::default(), Arc::new(MemoryDatabase::new())) }
}

/// Everything the write pipeline needs to know about the application it serves.
#[derive(Clone)]
pub struct Config {
    pub settings: AppSettings,
    /// Root URL of the REST API, used for `Location` headers.
    pub mount: String,
    pub database: SharedDatabase,
    pub triggers: Arc<TriggerRegistry>,
    pub files: Arc<dyn FilesController>,
    pub push: Arc<dyn PushController>,
    pub logger: Arc<dyn LoggerController>,
    pub user_controller: Arc<dyn UserController>,
    pub auth_data_manager: Arc<AuthDataManager>,
    valid: bool,
}

impl Config {
    fn from_parts(settings: AppSettings, handles: AppHandles, mount: &str, valid: bool) -> Self {
        Self {
            settings,
            mount: mount.trim_end_matches('/').to_string(),
            database: handles.database,
            triggers: handles.triggers,
            files: handles.files,
            push: handles.push,
            logger: handles.logger,
            user_controller: handles.user_controller,
            auth_data_manager: handles.auth_data_manager,
            valid,
        }
    }

    /// Stand-in for an unknown application: every lookup answers with defaults.
    pub fn invalid(app_id: &str, mount: &str) -> Self {
        let settings = AppSettings { app_id: app_id.to_string(), ..Default::default() };
        Self::from_parts(settings, AppHandles::default(), mount, false)
    }

    pub fn is_valid(&self) -> bool { self.valid }

    pub fn application_id(&self) -> &str { self.settings.app_id.as_str() }
}

struct CachedApp {
    settings: AppSettings,
    handles: AppHandles,
}

/// Registry of configured applications keyed by application id.
#[derive(Clone, Default)]
pub struct AppCache {
    apps: Arc<RwLock<HashMap<String, Arc<CachedApp>>>>,
}

impl AppCache {
    pub fn new() -> Self { Self::default() }

    /// Validate and (re)register an application.
    pub fn register(&self, settings: AppSettings, handles: AppHandles) -> Result<()> {
        settings.validate()?;
        info!(target: "basalt::config", "register app_id='{}' allow_client_class_creation={} verify_user_emails={}",
            settings.app_id, settings.allow_client_class_creation, settings.verify_user_emails);
        let app_id = settings.app_id.clone();
        self.apps.write().insert(app_id, Arc::new(CachedApp { settings, handles }));
        Ok(())
    }

    /// Drop an application so the next lookup sees it as unknown.
    pub fn remove(&self, app_id: &str) -> bool {
        self.apps.write().remove(app_id).is_some()
    }

    pub fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.apps.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve the configuration of `app_id`. Never fails: unknown ids yield an
    /// invalid config (see `Config::is_valid`).
    pub fn config(&self, app_id: &str, mount: &str) -> Config {
        let cached = self.apps.read().get(app_id).cloned();
        match cached {
            Some(app) => Config::from_parts(app.settings.clone(), app.handles.clone(), mount, true),
            None => Config::invalid(app_id, mount),
        }
    }
}
