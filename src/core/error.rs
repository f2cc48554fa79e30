use std::time::Duration;
use thiserror::Error;

use super::value::Value;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Concurrent access timeout: guard not acquired within {0:?}")]
    ConcurrentAccessTimeout(Duration),

    #[error("No such instance: {0}")]
    NoSuchInstance(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already removed: {0}")]
    AlreadyRemoved(String),

    #[error("Identity '{0}' already associated with a row in this transaction")]
    AlreadyAssociated(String),

    #[error("Callback '{callback}' failed: {message}")]
    Callback { callback: String, message: String },

    #[error("Passivation error: {0}")]
    Passivation(String),

    #[error("Transaction {0} is not active")]
    TransactionInactive(String),

    #[error("Transaction {0} rolled back")]
    RolledBack(String),

    #[error("No transaction in scope: {0}")]
    NoTransaction(String),

    #[error("Security check failed: {0}")]
    AccessDenied(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Application error: {0}")]
    Application(AppError),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

impl ContainerError {
    /// Application-level conditions are returned to the caller without
    /// forcing the surrounding transaction to roll back.
    pub fn is_application(&self) -> bool {
        matches!(
            self,
            ContainerError::DuplicateKey(_)
                | ContainerError::NotFound(_)
                | ContainerError::AlreadyRemoved(_)
                | ContainerError::Application(_)
        )
    }

    /// Callers may retry after a concurrent-access timeout; every other
    /// condition is either gone-for-good or a system failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ContainerError::ConcurrentAccessTimeout(_))
    }
}

impl From<std::io::Error> for ContainerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ContainerError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ContainerError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for ContainerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

/// Declared ("checked") business error raised by component code.
///
/// Application errors are a normal result from the container's point of view:
/// they travel back to the caller without rolling back the transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AppError {
    pub message: String,
}

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<AppError> for ContainerError {
    fn from(err: AppError) -> Self {
        Self::Application(err)
    }
}

/// Tagged result of one container-mediated invocation.
///
/// Application failures are a normal return and leave the transaction alone;
/// system failures force a rollback (or mark an inherited transaction
/// rollback-only).
#[derive(Debug)]
pub enum Outcome {
    Success(Value),
    Application(AppError),
    System(ContainerError),
}

impl Outcome {
    /// Fold a fallible invocation into its tagged form.
    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(ContainerError::Application(app)) => Outcome::Application(app),
            Err(err) if err.is_application() => Outcome::Application(AppError::new(err.to_string())),
            Err(err) => Outcome::System(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Outcome::System(_))
    }

    /// Collapse back into a plain result, for callers that do not care
    /// about the application/system distinction.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Application(app) => Err(ContainerError::Application(app)),
            Outcome::System(err) => Err(err),
        }
    }
}
