//! Radix-tree router, running as one more interceptor.
//!
//! The router is usually the innermost participant. On a match it calls the
//! route handler and short-circuits with its response; on a miss it hands
//! the request to the rest of the chain, so later interceptors (or the host's
//! 404) get their turn.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;
use tracing::trace;

use crate::chain::{BoxFuture, ChainResult, Interceptor, Next, Outcome};
use crate::context::RequestContext;
use crate::handler::{BoxedHandler, Handler};

/// Group the router conventionally registers under.
pub const ROUTE_GROUP: &str = "route";

/// One radix tree per method. Build once at startup, then register it:
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use tsugi::{Participant, RegisterOptions, Registry, Request, Response, Router};
/// # use http::Method;
/// # async fn get_user(_: Request) -> Response { Response::text("") }
/// let router = Router::new().on(Method::GET, "/users/{id}", get_user);
/// Registry::new().register(Participant::native(router), RegisterOptions::new().group("route"));
/// ```
pub struct Router {
    routes: HashMap<Method, MatchitRouter<BoxedHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Registers a handler for a method + path pair.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route or conflicts with one already
    /// registered for `method`.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, handler.into_boxed_handler())
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<(BoxedHandler, HashMap<String, String>)> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let handler = Arc::clone(matched.value);
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((handler, params))
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

impl Interceptor for Router {
    fn intercept<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult> {
        Box::pin(async move {
            let found = self.lookup(ctx.request().method(), ctx.request().path());
            let Some((handler, params)) = found else {
                trace!(path = ctx.request().path(), "no route, delegating");
                return next.run(ctx).await;
            };
            let req = ctx.request().clone().with_params(params);
            Ok(Outcome::Response(handler.call(req).await))
        })
    }
}
