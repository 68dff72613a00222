//! Unified application error model and mapping helpers.
//! Every failure surfaced by the write pipeline carries a numeric code from
//! `ErrorCode` plus a human readable message. The HTTP frontend maps the code
//! to a status and serializes the error as `{"code": n, "error": "..."}`.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum ErrorCode {
    InternalServerError = 1,
    ObjectNotFound = 101,
    InvalidClassName = 103,
    InvalidKeyName = 105,
    IncorrectType = 111,
    OperationForbidden = 119,
    InvalidAcl = 123,
    InvalidEmailAddress = 125,
    /// Device token matches several installations and no installation id was sent.
    InvalidInstallationId = 132,
    /// deviceToken/installationId/deviceType missing on an installation create.
    MissingRequiredField = 135,
    /// installationId, deviceToken or deviceType would change on update.
    ChangedImmutableField = 136,
    DuplicateValue = 137,
    InvalidRoleName = 139,
    ScriptFailed = 141,
    UsernameMissing = 200,
    PasswordMissing = 201,
    UsernameTaken = 202,
    EmailTaken = 203,
    SessionMissing = 206,
    AccountAlreadyLinked = 208,
    InvalidSessionToken = 209,
    UnsupportedService = 252,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 { self as i32 }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self { code as i32 }
}

impl TryFrom<i32> for ErrorCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        use ErrorCode::*;
        let code = match value {
            1 => InternalServerError,
            101 => ObjectNotFound,
            103 => InvalidClassName,
            105 => InvalidKeyName,
            111 => IncorrectType,
            119 => OperationForbidden,
            123 => InvalidAcl,
            125 => InvalidEmailAddress,
            132 => InvalidInstallationId,
            135 => MissingRequiredField,
            136 => ChangedImmutableField,
            137 => DuplicateValue,
            139 => InvalidRoleName,
            141 => ScriptFailed,
            200 => UsernameMissing,
            201 => PasswordMissing,
            202 => UsernameTaken,
            203 => EmailTaken,
            206 => SessionMissing,
            208 => AccountAlreadyLinked,
            209 => InvalidSessionToken,
            252 => UnsupportedService,
            other => return Err(format!("unknown error code {}", other)),
        };
        Ok(code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: ErrorCode,
    #[serde(rename = "error")]
    pub message: String,
}

impl AppError {
    pub fn new<S: Into<String>>(code: ErrorCode, msg: S) -> Self { AppError { code, message: msg.into() } }

    pub fn code(&self) -> ErrorCode { self.code }

    pub fn message(&self) -> &str { self.message.as_str() }

    pub fn internal<S: Into<String>>(msg: S) -> Self { Self::new(ErrorCode::InternalServerError, msg) }
    pub fn not_found<S: Into<String>>(msg: S) -> Self { Self::new(ErrorCode::ObjectNotFound, msg) }
    pub fn invalid_key<S: Into<String>>(msg: S) -> Self { Self::new(ErrorCode::InvalidKeyName, msg) }
    pub fn incorrect_type<S: Into<String>>(msg: S) -> Self { Self::new(ErrorCode::IncorrectType, msg) }
    pub fn forbidden<S: Into<String>>(msg: S) -> Self { Self::new(ErrorCode::OperationForbidden, msg) }
    pub fn script_failed<S: Into<String>>(msg: S) -> Self { Self::new(ErrorCode::ScriptFailed, msg) }
    pub fn unsupported_service() -> Self {
        Self::new(ErrorCode::UnsupportedService, "This authentication method is unsupported.")
    }
    pub fn account_already_linked() -> Self {
        Self::new(ErrorCode::AccountAlreadyLinked, "this auth is already used")
    }
    pub fn session_required() -> Self { Self::new(ErrorCode::InvalidSessionToken, "Session token required.") }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self.code {
            ErrorCode::InternalServerError => 500,
            ErrorCode::ObjectNotFound => 404,
            ErrorCode::OperationForbidden => 403,
            ErrorCode::InvalidSessionToken | ErrorCode::SessionMissing => 401,
            ErrorCode::UsernameTaken | ErrorCode::EmailTaken | ErrorCode::DuplicateValue | ErrorCode::AccountAlreadyLinked => 409,
            ErrorCode::ScriptFailed => 422,
            _ => 400,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_i32(), self.message)
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Default mapping: internal unless the chain already carries an AppError
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(other) => AppError::internal(other.to_string()),
        }
    }
}
