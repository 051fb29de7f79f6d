use std::error::Error;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::CircuitOpenError;

/// How a failure should be treated by the retry handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Retryable,
    Fatal,
    User,
    Network,
    Timeout,
    RateLimit,
    Resource,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
            Self::User => "user",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Resource => "resource",
        }
    }

    /// Fatal and user errors are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal | Self::User)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type returned by operations, tagged with its category at the point
/// it is constructed.
#[derive(Error, Debug, Clone)]
pub enum OperationError {
    #[error("{0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("invalid input: {0}")]
    User(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("resource exhausted: {0}")]
    Resource(String),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    /// An error raised by code outside this crate. `kind` is the foreign
    /// error's type name and drives classification.
    #[error("{kind}: {message}")]
    Foreign { kind: String, message: String },
}

impl OperationError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit(message.into())
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource(message.into())
    }

    pub fn foreign(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Foreign {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Retryable(_) => ErrorCategory::Retryable,
            Self::Fatal(_) => ErrorCategory::Fatal,
            Self::User(_) => ErrorCategory::User,
            Self::Network(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::RateLimit(_) => ErrorCategory::RateLimit,
            Self::Resource(_) => ErrorCategory::Resource,
            Self::CircuitOpen(_) => ErrorCategory::Retryable,
            Self::Foreign { kind, .. } => categorize_type_name(kind),
        }
    }
}

/// Classifies an error. Known concrete kinds anywhere in the `source()` chain
/// win; otherwise the error's type name is matched against keywords, and
/// anything unmatched is retryable.
pub fn categorize_error<E>(error: &E) -> ErrorCategory
where
    E: Error + 'static,
{
    explicit_category(error).unwrap_or_else(|| categorize_type_name(&short_type_name::<E>()))
}

fn explicit_category(error: &(dyn Error + 'static)) -> Option<ErrorCategory> {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(op) = err.downcast_ref::<OperationError>() {
            return Some(op.category());
        }
        if err.is::<CircuitOpenError>() {
            return Some(ErrorCategory::Retryable);
        }
        if err.is::<tokio::time::error::Elapsed>() {
            return Some(ErrorCategory::Timeout);
        }
        if err.is::<serde_json::Error>() {
            return Some(ErrorCategory::User);
        }
        if let Some(category) = err.downcast_ref::<io::Error>().and_then(io_category) {
            return Some(category);
        }
        current = err.source();
    }
    None
}

fn io_category(err: &io::Error) -> Option<ErrorCategory> {
    use io::ErrorKind::*;
    match err.kind() {
        TimedOut => Some(ErrorCategory::Timeout),
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | AddrInUse
        | AddrNotAvailable | BrokenPipe => Some(ErrorCategory::Network),
        OutOfMemory => Some(ErrorCategory::Resource),
        InvalidInput | InvalidData => Some(ErrorCategory::User),
        PermissionDenied => Some(ErrorCategory::Fatal),
        Interrupted | WouldBlock => Some(ErrorCategory::Retryable),
        _ => None,
    }
}

/// Keyword fallback for errors without an explicit category.
pub fn categorize_type_name(name: &str) -> ErrorCategory {
    let name = name.to_ascii_lowercase();
    if name.contains("timeout") || name.contains("elapsed") {
        ErrorCategory::Timeout
    } else if name.contains("connection") || name.contains("network") {
        ErrorCategory::Network
    } else if name.contains("rate") || name.contains("limit") {
        ErrorCategory::RateLimit
    } else if name.contains("memory") || name.contains("resource") {
        ErrorCategory::Resource
    } else if ["value", "type", "attribute", "parse"]
        .iter()
        .any(|kw| name.contains(kw))
    {
        ErrorCategory::User
    } else {
        ErrorCategory::Retryable
    }
}

/// Last path segment of `E`'s type name, without generic arguments.
pub(crate) fn short_type_name<E: ?Sized>() -> String {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Name recorded in error history: the foreign kind when the error carries
/// one, the Rust type name otherwise.
pub(crate) fn error_type_name<E>(error: &E) -> String
where
    E: Error + 'static,
{
    match (error as &(dyn Error + 'static)).downcast_ref::<OperationError>() {
        Some(OperationError::Foreign { kind, .. }) => kind.clone(),
        _ => short_type_name::<E>(),
    }
}
