use std::path::PathBuf;

use thiserror::Error;
use warp::http::StatusCode;
use warp::reply::{Reply, Response};

/// Errors that stop the webhook from starting
#[derive(Error, Debug)]
pub enum Error {
    /// The policy file could not be loaded
    #[error("Policy Error: {0}")]
    Policy(#[from] PolicyError),

    /// A file required at startup could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An outbound HTTP client could not be built
    #[error("HTTP Client Error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The log filter could not be parsed
    #[error("invalid log level {0:?}")]
    LogLevel(String),
}

/// Errors raised while loading a policy document
///
/// All of them are fatal: a policy either loads completely or not at all.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("policy rules must be a non-empty list")]
    EmptyRules,

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("condition must be null/Always (default) or Exists, not {0}")]
    InvalidCondition(String),
}

/// Errors that fail a single admission request
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// The request body is not an admission review
    #[error("could not parse request: {0}")]
    InvalidBody(#[source] serde_json::Error),

    /// The admission review carries no request
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// The admitted object does not decode as a pod
    #[error("could not unmarshal pod spec: {0}")]
    InvalidObject(#[source] serde_json::Error),

    /// The patch could not be attached to the response
    #[error("could not marshal patches: {0}")]
    Patch(String),
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBody(_) | Self::InvalidReview(_) | Self::InvalidObject(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Patch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Reply for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::error!({ err = &self as &dyn std::error::Error }, "rejecting admission request");
        warp::reply::with_status(warp::reply(), status).into_response()
    }
}

/// Result type for tugger operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
