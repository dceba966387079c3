//! Engine error types
//!
//! Every fallible engine operation returns [`EngineResult`]. Errors are grouped
//! into coarse [`ErrorKind`]s so callers can decide how to surface them without
//! matching on individual variants.

use serde::Serialize;
use thiserror::Error;

/// Canonical discriminator carried by queries stopped through `cancel()`.
pub const CANCELED_BY_USER: &str = "CANCELED_BY_USER";

pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse classification of an [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Local state does not allow the call (no connection, connect in flight, ...)
    Precondition,
    /// Driver-level connect failure or tunnel failure
    Connection,
    /// The query was stopped on request; not a failure
    CanceledByUser,
    /// The engine variant does not implement the operation
    CapabilityGap,
    /// Error reported by the database itself
    Driver,
    Internal,
}

#[derive(Debug, Error, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum EngineError {
    #[error("There is no connection available.")]
    NoConnection,

    #[error("There is already a connection in progress for this database. Wait until it finishes.")]
    ConnectInProgress,

    #[error("Query not ready to be canceled")]
    NotCancelable,

    #[error("Query has already been executed")]
    QueryAlreadyStarted,

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unknown database client: {driver}")]
    DriverNotFound { driver: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("SSH tunnel error: {message}")]
    SshError { message: String },

    #[error("Query canceled by user. The query process may still be running in the database.")]
    CanceledByUser,

    #[error("Not supported: {message}")]
    NotSupported { message: String },

    #[error("Syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Execution error: {message}")]
    ExecutionError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn driver_not_found(driver: impl Into<String>) -> Self {
        Self::DriverNotFound {
            driver: driver.into(),
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    pub fn ssh(message: impl Into<String>) -> Self {
        Self::SshError {
            message: message.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::SyntaxError {
            message: message.into(),
        }
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
            code: None,
        }
    }

    pub fn execution_error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoConnection
            | Self::ConnectInProgress
            | Self::NotCancelable
            | Self::QueryAlreadyStarted
            | Self::InvalidConfig { .. } => ErrorKind::Precondition,
            Self::ConnectionFailed { .. } | Self::AuthFailed { .. } | Self::SshError { .. } => {
                ErrorKind::Connection
            }
            Self::CanceledByUser => ErrorKind::CanceledByUser,
            Self::NotSupported { .. } | Self::DriverNotFound { .. } => ErrorKind::CapabilityGap,
            Self::SyntaxError { .. } | Self::ExecutionError { .. } => ErrorKind::Driver,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Stable marker callers can match on instead of the message text.
    pub fn discriminator(&self) -> Option<&'static str> {
        match self {
            Self::CanceledByUser => Some(CANCELED_BY_USER),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::CanceledByUser)
    }

    /// Native error code reported by the driver, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::ExecutionError { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                match db_err.code() {
                    // 42601: postgres syntax_error, 1064: mysql ER_PARSE_ERROR
                    Some(code) if code == "42601" || code == "1064" || code == "42000" => {
                        if message.to_ascii_lowercase().contains("syntax") {
                            Self::syntax_error(message)
                        } else {
                            Self::execution_error_with_code(message, code.into_owned())
                        }
                    }
                    Some(code) => Self::execution_error_with_code(message, code.into_owned()),
                    None => Self::execution_error(message),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::connection_failed(err.to_string())
            }
            _ => Self::execution_error(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message) => {
                if failure.code == rusqlite::ErrorCode::OperationInterrupted {
                    return Self::CanceledByUser;
                }
                let message = message.clone().unwrap_or_else(|| err.to_string());
                if message.contains("syntax error") {
                    Self::syntax_error(message)
                } else {
                    Self::execution_error_with_code(message, failure.extended_code.to_string())
                }
            }
            _ => Self::execution_error(err.to_string()),
        }
    }
}
