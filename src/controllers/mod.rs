//! Controllers the write pipeline calls into: file URL expansion, user email
//! verification, auth-provider validation, push delivery and logging.
//! Keep the public surface thin and split implementation across sub-modules.

mod auth_data;
mod files;
mod logger;
mod push;
mod user;

pub use auth_data::{AnonymousValidator, AuthDataManager, AuthDataValidator, FnValidator};
pub use files::{DefaultFilesController, FilesController};
pub use logger::{LogLevel, LoggerController, TracingLogger};
pub use push::{LoggingPushController, PushController, PushRequest};
pub use user::{DefaultUserController, EmailOptions, LoggingMailAdapter, Mail, MailAdapter, UserController};
