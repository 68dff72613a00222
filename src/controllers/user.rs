use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::crypto;
use crate::error::AppResult;
use crate::storage::Object;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub text: String,
}

#[async_trait]
pub trait MailAdapter: Send + Sync {
    async fn send_mail(&self, mail: Mail) -> AppResult<()>;
}

/// Writes outgoing mail to the log and keeps a copy in memory.
#[derive(Debug, Clone, Default)]
pub struct LoggingMailAdapter {
    outbox: Arc<Mutex<Vec<Mail>>>,
}

impl LoggingMailAdapter {
    pub fn new() -> Self { Self::default() }

    pub fn sent(&self) -> Vec<Mail> { self.outbox.lock().clone() }
}

#[async_trait]
impl MailAdapter for LoggingMailAdapter {
    async fn send_mail(&self, mail: Mail) -> AppResult<()> {
        info!(target: "basalt::mail", "send_mail: to='{}' subject='{}'", mail.to, mail.subject);
        self.outbox.lock().push(mail);
        Ok(())
    }
}

#[async_trait]
pub trait UserController: Send + Sync {
    /// Prepare a user payload for email verification before it is persisted.
    fn set_email_verify_token(&self, user: &mut Object);

    async fn send_verification_email(&self, user: Object) -> AppResult<()>;
}

/// Settings the default user controller needs from the app configuration.
#[derive(Debug, Clone, Default)]
pub struct EmailOptions {
    pub verify_user_emails: bool,
    pub app_name: String,
    pub verify_email_url: String,
}

pub struct DefaultUserController {
    options: EmailOptions,
    mail: Arc<dyn MailAdapter>,
}

impl DefaultUserController {
    pub fn new(options: EmailOptions, mail: Arc<dyn MailAdapter>) -> Self { Self { options, mail } }

    fn verify_link(&self, user: &Object) -> Option<String> {
        let token = user.get("_email_verify_token")?.as_str()?;
        let username = user.get("username").and_then(|u| u.as_str()).unwrap_or_default();
        Some(format!(
            "{}?token={}&username={}",
            self.options.verify_email_url,
            urlencoding::encode(token),
            urlencoding::encode(username)
        ))
    }
}

#[async_trait]
impl UserController for DefaultUserController {
    fn set_email_verify_token(&self, user: &mut Object) {
        if !self.options.verify_user_emails { return; }
        match crypto::new_token() {
            Ok(token) => {
                user.insert("_email_verify_token".into(), Value::String(token));
                user.insert("emailVerified".into(), Value::Bool(false));
            }
            Err(e) => warn!(target: "basalt::user", "set_email_verify_token: token generation failed: {}", e),
        }
    }

    async fn send_verification_email(&self, user: Object) -> AppResult<()> {
        if !self.options.verify_user_emails { return Ok(()); }
        let Some(to) = user.get("email").and_then(|e| e.as_str()) else { return Ok(()); };
        let Some(link) = self.verify_link(&user) else { return Ok(()); };
        let mail = Mail {
            to: to.to_string(),
            subject: format!("Please verify your e-mail for {}", self.options.app_name),
            text: format!(
                "Hi,\n\nYou are being asked to confirm the e-mail address {} with {}\n\nClick here to confirm it:\n{}",
                to, self.options.app_name, link
            ),
        };
        self.mail.send_mail(mail).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn controller(enabled: bool) -> (DefaultUserController, LoggingMailAdapter) {
        let mail = LoggingMailAdapter::new();
        let opts = EmailOptions {
            verify_user_emails: enabled,
            app_name: "demo".into(),
            verify_email_url: "https://api.example.com/apps/app1/verify_email".into(),
        };
        (DefaultUserController::new(opts, Arc::new(mail.clone())), mail)
    }

    #[tokio::test]
    async fn verification_disabled_is_inert() {
        let (c, mail) = controller(false);
        let mut user = json!({"username": "u1", "email": "a@b"}).as_object().cloned().unwrap();
        c.set_email_verify_token(&mut user);
        assert!(user.get("_email_verify_token").is_none());
        c.send_verification_email(user).await.unwrap();
        assert!(mail.sent().is_empty());
    }

    #[tokio::test]
    async fn verification_sends_link() {
        let (c, mail) = controller(true);
        let mut user = json!({"username": "u 1", "email": "a@b"}).as_object().cloned().unwrap();
        c.set_email_verify_token(&mut user);
        assert_eq!(user["emailVerified"], false);
        let token = user["_email_verify_token"].as_str().unwrap().to_string();
        c.send_verification_email(user).await.unwrap();
        let sent = mail.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@b");
        assert!(sent[0].text.contains(&format!("verify_email?token={}&username=u%201", token)));
    }
}
