use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discriminant callers match on. Hosts pick the kind; the adapter forwards it untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown store or index name, or a missing record where one is required.
    NotFound,
    /// The owning transaction was aborted while the request was pending.
    Abort,
    /// Request issued against a finished transaction or a closed connection.
    State,
    /// A write would violate a key or unique-index constraint.
    Constraint,
    /// Invalid key, key path or value, including transformer failures.
    Data,
    /// Write attempted inside a read-only transaction.
    ReadOnly,
    /// Requested version is lower than the stored one.
    Version,
    /// The host failed underneath (I/O, persistence).
    Backend,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Abort => "abort",
            Self::State => "state",
            Self::Constraint => "constraint",
            Self::Data => "data",
            Self::ReadOnly => "read_only",
            Self::Version => "version",
            Self::Backend => "backend",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct StoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Abort, message)
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Constraint, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, message)
    }

    pub fn read_only(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReadOnly, message)
    }

    pub fn version(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Version, message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backend, message)
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
