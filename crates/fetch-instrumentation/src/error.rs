//! Error types for fetch calls and instrumentation setup.

use std::error::Error as StdError;

use thiserror::Error;

/// Failure of an underlying fetch call.
///
/// The instrumentation records these on the span and hands them back to the
/// caller untouched.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to fetch {url}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out")]
    Timeout {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read response body")]
    Body(#[source] reqwest::Error),

    #[error("the operation was aborted")]
    Aborted,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("`{property}` is not available on {scope}")]
    Unavailable { scope: String, property: String },
}

impl FetchError {
    /// Map a reqwest failure for `url` onto the fetch taxonomy.
    pub fn from_reqwest(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                source,
            }
        } else if source.is_body() || source.is_decode() {
            FetchError::Body(source)
        } else {
            FetchError::Network {
                url: url.to_string(),
                source,
            }
        }
    }

    /// Stable error name, recorded as `http.error_name` and `exception.type`.
    pub fn name(&self) -> &'static str {
        match self {
            FetchError::Network { .. } => "NetworkError",
            FetchError::Timeout { .. } => "TimeoutError",
            FetchError::Body(_) => "BodyError",
            FetchError::Aborted => "AbortError",
            FetchError::InvalidRequest(_) => "InvalidRequestError",
            FetchError::Unavailable { .. } => "UnavailableError",
        }
    }
}

/// Render an error and its whole `source()` chain, one cause per line.
///
/// Stands in for a stack trace in `exception.stacktrace`.
pub fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Failure while building a [`crate::FetchInstrumentation`].
#[derive(Debug, Error)]
pub enum InstrumentationError {
    #[error("invalid url pattern `{pattern}`")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid origin `{origin}`")]
    InvalidOrigin {
        origin: String,
        #[source]
        source: url::ParseError,
    },
}
