use thiserror::Error;

/// Errors raised while driving the release gate protocol.
///
/// Every variant is fatal for the invocation that produced it. A policy
/// failure (FAILED verdict) is never an error; it is a [`super::GateResult`].
#[derive(Error, Debug)]
pub enum GateError {
    /// Missing product, sub-products, environment or token
    #[error("{0}")]
    Configuration(String),

    /// Remote service answered with a non-2xx status
    #[error("Server returned HTTP response code: {status} for URL: {url} with message: {body}")]
    Http { status: u16, url: String, body: String },

    /// Connection, TLS or timeout failure before a status was received
    #[error("Transport error for URL {url}: {message}")]
    Transport { url: String, message: String },

    /// Response body is not the structure we expect
    #[error("Malformed response: {0}")]
    Protocol(String),

    /// Every permitted attempt ended in a transport or protocol error
    #[error("ArmorCode request error after maximum retries ({attempts} attempts)")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<GateError>,
    },

    /// The surrounding invocation was cancelled
    #[error("ArmorCode release gate aborted")]
    Aborted,
}

impl GateError {
    /// Transport and protocol errors are retried by the state machine.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GateError::Http { .. } | GateError::Transport { .. } | GateError::Protocol(_)
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            GateError::Http { status, .. } => Some(*status),
            GateError::Exhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }
}
