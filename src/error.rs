//! Unified error type.

use std::borrow::Cow;

use http::StatusCode;

use crate::response::{IntoResponse, Response};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by tsugi's fallible operations.
///
/// Errors raised by interceptors travel up through every `next().run(..)`
/// call site until an upstream interceptor converts them or the pipeline
/// returns them to the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A link broke the continuation contract, e.g. called `next` twice.
    #[error("invalid chain usage by `{identity}`: {reason}")]
    InvalidChainUsage {
        identity: String,
        reason: &'static str,
    },

    /// A link failed, or a legacy handler signalled an error.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The entry source could not enumerate an extension point.
    #[error("failed to discover interceptors for `{extension_point}`: {reason}")]
    Discovery {
        extension_point: String,
        reason: String,
    },

    /// The response was aborted; the host drops the connection.
    #[error("response aborted")]
    Aborted,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure reported by an interceptor or a legacy handler.
///
/// Carries the HTTP status the host should answer with when nothing
/// upstream recovers from it. Defaults to `500 Internal Server Error`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: Cow<'static, str>,
    status: StatusCode,
    #[source]
    source: Option<BoxError>,
}

impl HandlerError {
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            source: None,
        }
    }

    /// Wraps an arbitrary error, keeping it reachable via `source()`.
    pub fn from_source(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self {
            message: source.to_string().into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            source: Some(source),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn message(&self) -> &str { &self.message }
    pub fn status(&self) -> StatusCode { self.status }
}

impl Error {
    /// The status the host answers with when this error escapes the pipeline.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Handler(e) => e.status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Client errors keep their message; server errors only expose the reason
/// phrase.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Handler(e) if status.is_client_error() => e.message().to_owned(),
            _ => status.canonical_reason().unwrap_or_default().to_owned(),
        };
        Response::builder().status(status).text(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_keeps_status_and_source() {
        let io = std::io::Error::other("disk on fire");
        let err = HandlerError::from_source(io).with_status(StatusCode::BAD_GATEWAY);

        assert_eq!(err.message(), "disk on fire");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn server_errors_hide_their_message() {
        let res = Error::from(HandlerError::new("secret detail")).into_response();
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&res.body()[..], b"Internal Server Error");

        let res = Error::from(HandlerError::new("missing id").with_status(StatusCode::BAD_REQUEST))
            .into_response();
        assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(&res.body()[..], b"missing id");
    }
}
