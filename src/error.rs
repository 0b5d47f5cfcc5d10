use strum::Display;
use thiserror::Error;

use crate::types::ResponseBody;
use crate::types::Verb;

/// Invalid construction or setter arguments. These are programmer errors and are reported synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("cannot {0} while requests are outstanding")]
    Busy(&'static str),

    #[error("failed to build {what}: {message}")]
    Builder { what: &'static str, message: String },
}

impl From<garde::Report> for ConfigError {
    fn from(report: garde::Report) -> Self {
        Self::Invalid(report.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransportErrorKind {
    Abort,
    Error,
    Timeout,
}

/// Network-level failure as reported by a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind:    TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Abort, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Error, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }
}

/// Everything that can go wrong with a request, as seen by the caller.
///
/// Cloneable since one failed batch may have to be reported to every caller waiting for one of its keys.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("{verb} {url} failed: {source}")]
    Transport {
        verb:   Verb,
        url:    String,
        #[source]
        source: TransportError,
    },

    #[error("{verb} {url} responded with status {status}")]
    Status {
        verb:   Verb,
        url:    String,
        status: u16,
        body:   ResponseBody,
    },

    #[error("{verb} {url} responded with unknown status {status}")]
    UnknownStatus {
        verb:   Verb,
        url:    String,
        status: u16,
        body:   ResponseBody,
    },

    #[error("cannot decode response of {verb} {url}: {message}")]
    Decode { verb: Verb, url: String, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("request owner went away before the request completed")]
    Gone,
}

impl FetchError {
    /// Status code of the response, if the request got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } | Self::UnknownStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
