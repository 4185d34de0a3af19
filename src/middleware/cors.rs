//! Cross-origin resource sharing.
//!
//! Preflight requests (`OPTIONS` with `access-control-request-method`) are
//! answered here and never reach the rest of the chain. Simple requests
//! continue downstream and get `access-control-allow-origin` on the way out.

use std::time::Duration;

use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_METHOD, HeaderValue, ORIGIN,
};
use http::{Method, StatusCode};
use tracing::trace;

use crate::chain::{BoxFuture, ChainResult, Interceptor, Next, Outcome};
use crate::context::RequestContext;
use crate::response::Response;

pub const CORS_GROUP: &str = "cors";

/// CORS policy.
#[derive(Clone, Debug)]
pub struct Cors {
    allow_origin: HeaderValue,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
    max_age: Option<Duration>,
}

impl Cors {
    /// Allows a single origin, e.g. `https://app.example.com`.
    pub fn new(origin: HeaderValue) -> Self {
        Self {
            allow_origin: origin,
            allow_methods: HeaderValue::from_static("GET, HEAD, PUT, PATCH, POST, DELETE"),
            allow_headers: HeaderValue::from_static("*"),
            max_age: None,
        }
    }

    /// Any origin, the common methods, any header.
    pub fn permissive() -> Self {
        Self::new(HeaderValue::from_static("*"))
    }

    /// Methods advertised to preflight requests. Ignored if empty.
    pub fn allow_methods(mut self, methods: &[Method]) -> Self {
        let joined = methods.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
        if let Ok(value) = HeaderValue::try_from(joined) {
            if !value.is_empty() {
                self.allow_methods = value;
            }
        }
        self
    }

    pub fn allow_headers(mut self, headers: HeaderValue) -> Self {
        self.allow_headers = headers;
        self
    }

    /// How long browsers may cache a preflight answer.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    fn preflight(&self) -> Response {
        let mut res = Response::status(StatusCode::NO_CONTENT);
        let headers = res.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
        if let Some(max_age) = self.max_age {
            headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(max_age.as_secs()));
        }
        res
    }
}

impl Interceptor for Cors {
    fn intercept<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult> {
        Box::pin(async move {
            let req = ctx.request();
            if !req.headers().contains_key(ORIGIN) {
                return next.run(ctx).await;
            }

            if req.method() == Method::OPTIONS && req.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD) {
                trace!(path = req.path(), "answering preflight");
                return Outcome::respond(self.preflight());
            }

            // Writer first, for links that answer through it.
            ctx.response().insert_header(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
            match next.run(ctx).await? {
                Outcome::Response(mut res) => {
                    res.headers_mut()
                        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
                    Ok(Outcome::Response(res))
                }
                other => Ok(other),
            }
        })
    }
}
