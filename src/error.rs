//! Error types - every failure has a local recovery path, nothing here is fatal

use thiserror::Error;

/// Rejected input. The operation is a no-op and state is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("session has no exercises")]
    EmptySession,

    #[error("routine needs a name and at least one exercise")]
    EmptyRoutine,

    #[error("username is already taken")]
    UsernameTaken,

    #[error("health entry has no measurement")]
    NoMeasurement,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Credential failures. Unknown user and wrong password look the same.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("invalid username or recovery code")]
    InvalidRecoveryCode,
}

/// Remote document store failures. In-memory state stays authoritative.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote store unreachable: {0}")]
    Unreachable(String),

    #[error("remote store rejected write: {0}")]
    Rejected(String),

    #[error("remote document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("not signed in to a cloud account")]
    NotSignedIn,
}

/// Fitness sink and plan generator failures. Never reach session/profile state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalServiceError {
    #[error("fitness log sink failed: {0}")]
    FitnessSink(String),

    #[error("plan generator failed: {0}")]
    PlanGenerator(String),
}

/// Crate-wide error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    External(#[from] ExternalServiceError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
