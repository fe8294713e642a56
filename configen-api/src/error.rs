use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Error returned by client operations.
///
/// Errors are `Clone` because a failing deduplicated request propagates the
/// same failure to every caller joined on the shared in-flight future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn authentication<S: Into<String>>(message: S) -> Self {
        ErrorKind::Authentication(message.into()).into()
    }

    pub fn registration<S: Into<String>>(message: S) -> Self {
        ErrorKind::Registration(message.into()).into()
    }

    pub fn status<S: Into<String>>(status: u16, message: S) -> Self {
        ErrorKind::Status {
            status,
            message: message.into(),
        }
        .into()
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        ErrorKind::Network(message.into()).into()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
