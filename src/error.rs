use serde::{Deserialize, Serialize};

use crate::http::HttpResponse;

/// Errors surfaced by the worker and the client façade.
///
/// Errors travel from the worker thread to the caller as JSON, so every
/// variant carries plain data only. Transport and codec failures are
/// flattened to strings at the point where they occur.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Raised by the client before anything is posted to the worker.
    #[error("The object has not been initialized yet")]
    NotInitialized,

    /// Raised by the worker for any message other than `INIT` received
    /// before a host exists.
    #[error("Worker has not been initiated")]
    WorkerNotInitiated,

    #[error("You have not signed in yet")]
    NotSignedIn,

    /// The request URL does not start with any configured base URL.
    #[error("The provided URL is illegal.")]
    IllegalUrl,

    #[error("Request failed with status code {status}")]
    Http {
        status: u16,
        response: Box<HttpResponse>,
    },

    #[error("HTTP transport error: {0}")]
    Transport(String),

    #[error("OAuth2 error: {0}")]
    OAuth(String),

    #[error("Token verification error: {0}")]
    Token(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("The worker is no longer running")]
    WorkerTerminated,

    #[error("Something went wrong during authentication. {0}")]
    Authentication(String),
}

impl Error {
    /// HTTP status of a failed response, if this error carries one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn http(response: HttpResponse) -> Self {
        Self::Http {
            status: response.status,
            response: Box::new(response),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidMessage(e.to_string())
    }
}
