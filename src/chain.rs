//! The interceptor chain: ordered links run as nested continuations.
//!
//! ```text
//! chain.invoke(ctx)
//!   └─ link 0 .intercept(ctx, next₀)
//!        └─ next₀.run(ctx) ── link 1 .intercept(ctx, next₁)
//!                               └─ next₁.run(ctx) ── … ── Outcome::EndOfChain
//! ```
//!
//! Each link decides whether the rest of the chain runs at all. Returning
//! without calling [`Next::run`] short-circuits; calling it a second time is
//! a contract violation that fails the whole chain with
//! [`Error::InvalidChainUsage`].
//!
//! A [`Next`] borrows its chain, so it cannot outlive the link's own future:
//! delegating after the link has already returned does not type-check.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, trace, warn};

use crate::context::{RequestContext, Termination};
use crate::error::Error;
use crate::response::{IntoResponse, Response};

/// A heap-allocated, type-erased future borrowed for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What every link, and the chain as a whole, resolves to.
pub type ChainResult = Result<Outcome, Error>;

const NEXT_TWICE: &str = "next() called more than once";

/// The value a chain produces.
#[derive(Debug)]
pub enum Outcome {
    /// Sentinel returned by the `next` that runs past the last link.
    EndOfChain,
    /// A link produced a response value.
    Response(Response),
    /// The response was closed out-of-band, typically by a legacy handler.
    Closed(Termination),
}

impl Outcome {
    /// Short-circuits with `res`: `return Outcome::respond(StatusCode::FORBIDDEN)`.
    pub fn respond(res: impl IntoResponse) -> ChainResult {
        Ok(Self::Response(res.into_response()))
    }

    pub fn is_end_of_chain(&self) -> bool {
        matches!(self, Self::EndOfChain)
    }
}

// ── Interceptor ───────────────────────────────────────────────────────────────

/// A participant in the chain.
///
/// Implementations receive the request context and the continuation for
/// the remaining links. Box the body with `Box::pin(async move { … })`.
///
/// ```rust
/// use tsugi::{BoxFuture, ChainResult, Interceptor, Next, RequestContext};
///
/// struct RequestCounter;
///
/// impl Interceptor for RequestCounter {
///     fn intercept<'a>(
///         &'a self,
///         ctx: &'a mut RequestContext,
///         next: Next<'a>,
///     ) -> BoxFuture<'a, ChainResult> {
///         Box::pin(async move {
///             let outcome = next.run(ctx).await;
///             tracing::debug!(ok = outcome.is_ok(), "downstream finished");
///             outcome
///         })
///     }
/// }
/// ```
pub trait Interceptor: Send + Sync + 'static {
    fn intercept<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult>;
}

/// Builds an [`Interceptor`] from a closure returning a boxed future.
///
/// ```rust
/// use tsugi::{Outcome, chain::from_fn};
///
/// let teapot = from_fn(|_ctx, _next| {
///     Box::pin(async move { Outcome::respond(http::StatusCode::IM_A_TEAPOT) })
/// });
/// ```
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: for<'a> Fn(&'a mut RequestContext, Next<'a>) -> BoxFuture<'a, ChainResult>
        + Send
        + Sync
        + 'static,
{
    FromFn(f)
}

/// See [`from_fn`].
pub struct FromFn<F>(F);

impl<F> Interceptor for FromFn<F>
where
    F: for<'a> Fn(&'a mut RequestContext, Next<'a>) -> BoxFuture<'a, ChainResult>
        + Send
        + Sync
        + 'static,
{
    fn intercept<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult> {
        (self.0)(ctx, next)
    }
}

// ── Chain ─────────────────────────────────────────────────────────────────────

/// Lifecycle of a single chain execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainState {
    NotStarted,
    /// `cursor` is the index of the most recently entered link.
    Running { cursor: usize },
    /// The last link delegated and the end of the chain was reached.
    Completed,
    /// Some link returned without delegating.
    ShortCircuited,
    Errored,
}

struct Link {
    identity: Arc<str>,
    interceptor: Arc<dyn Interceptor>,
    delegated: AtomicBool,
}

/// One execution of an ordered list of interceptors.
///
/// Built fresh for every request and discarded once it reaches a terminal
/// [`ChainState`]. Invoking it twice fails.
pub struct Chain {
    links: Vec<Link>,
    started: AtomicBool,
    cursor: AtomicUsize,
    reached_end: AtomicBool,
    violation: OnceLock<Arc<str>>,
    terminal: OnceLock<ChainState>,
}

impl Chain {
    pub fn new<I, S>(links: I) -> Self
    where
        I: IntoIterator<Item = (S, Arc<dyn Interceptor>)>,
        S: Into<Arc<str>>,
    {
        let links = links
            .into_iter()
            .map(|(identity, interceptor)| Link {
                identity: identity.into(),
                interceptor,
                delegated: AtomicBool::new(false),
            })
            .collect();

        Self {
            links,
            started: AtomicBool::new(false),
            cursor: AtomicUsize::new(0),
            reached_end: AtomicBool::new(false),
            violation: OnceLock::new(),
            terminal: OnceLock::new(),
        }
    }

    pub fn len(&self) -> usize { self.links.len() }
    pub fn is_empty(&self) -> bool { self.links.is_empty() }

    /// Link identities in execution order.
    pub fn identities(&self) -> impl Iterator<Item = &str> + '_ {
        self.links.iter().map(|l| &*l.identity)
    }

    pub fn state(&self) -> ChainState {
        if let Some(state) = self.terminal.get() {
            return *state;
        }
        if self.started.load(Ordering::Acquire) {
            ChainState::Running { cursor: self.cursor.load(Ordering::Acquire) }
        } else {
            ChainState::NotStarted
        }
    }

    /// Runs the chain against `ctx`.
    ///
    /// Errors raised by links propagate unchanged. A repeated `next` call
    /// fails the chain even if the offending link swallowed the error.
    pub async fn invoke(&self, ctx: &mut RequestContext) -> ChainResult {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidChainUsage {
                identity: "<chain>".to_owned(),
                reason: "a chain runs at most once",
            });
        }

        let head = Next { chain: self, caller: None, index: 0 };
        let result = match (head.run(ctx).await, self.violation.get()) {
            (Err(e @ Error::InvalidChainUsage { .. }), _) => Err(e),
            (_, Some(identity)) => Err(Error::InvalidChainUsage {
                identity: identity.to_string(),
                reason: NEXT_TWICE,
            }),
            (result, None) => result,
        };

        let state = match &result {
            Err(_) => ChainState::Errored,
            Ok(_) if self.reached_end.load(Ordering::Acquire) => ChainState::Completed,
            Ok(_) => ChainState::ShortCircuited,
        };
        let _ = self.terminal.set(state);
        debug!(links = self.links.len(), ?state, "chain finished");

        result
    }
}

// ── Next ──────────────────────────────────────────────────────────────────────

/// Continuation handed to each link: runs everything after it.
pub struct Next<'a> {
    chain: &'a Chain,
    /// Link that owns this continuation; `None` for the chain head.
    caller: Option<usize>,
    index: usize,
}

impl Next<'_> {
    /// Runs the remaining links and returns their outcome.
    ///
    /// Only the first call per link does anything; later calls return
    /// [`Error::InvalidChainUsage`] and mark the chain as failed.
    pub async fn run(&self, ctx: &mut RequestContext) -> ChainResult {
        if let Some(caller) = self.caller {
            let owner = &self.chain.links[caller];
            if owner.delegated.swap(true, Ordering::AcqRel) {
                warn!(interceptor = %owner.identity, "{}", NEXT_TWICE);
                let _ = self.chain.violation.set(Arc::clone(&owner.identity));
                return Err(Error::InvalidChainUsage {
                    identity: owner.identity.to_string(),
                    reason: NEXT_TWICE,
                });
            }
        }

        let Some(link) = self.chain.links.get(self.index) else {
            self.chain.reached_end.store(true, Ordering::Release);
            trace!("end of chain");
            return Ok(Outcome::EndOfChain);
        };

        self.chain.cursor.store(self.index, Ordering::Release);
        trace!(interceptor = %link.identity, cursor = self.index, "entering");

        let next = Next {
            chain: self.chain,
            caller: Some(self.index),
            index: self.index + 1,
        };
        link.interceptor.intercept(ctx, next).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use http::StatusCode;

    use super::*;
    use crate::error::HandlerError;

    type Journal = Arc<Mutex<Vec<String>>>;

    enum Act {
        Pass,
        ShortCircuit,
        DelegateTwice,
        Fail,
        /// Converts a downstream error into a response.
        Recover,
    }

    struct Probe {
        name: &'static str,
        act: Act,
        journal: Journal,
    }

    impl Probe {
        fn link(name: &'static str, act: Act, journal: &Journal) -> (&'static str, Arc<dyn Interceptor>) {
            (name, Arc::new(Probe { name, act, journal: Arc::clone(journal) }))
        }

        fn note(&self, event: &str) {
            self.journal.lock().unwrap().push(format!("{}:{event}", self.name));
        }
    }

    impl Interceptor for Probe {
        fn intercept<'a>(
            &'a self,
            ctx: &'a mut RequestContext,
            next: Next<'a>,
        ) -> BoxFuture<'a, ChainResult> {
            Box::pin(async move {
                self.note("in");
                let outcome = match self.act {
                    Act::Pass => next.run(ctx).await,
                    Act::ShortCircuit => Outcome::respond(self.name),
                    Act::DelegateTwice => {
                        let first = next.run(ctx).await;
                        let second = next.run(ctx).await;
                        assert!(matches!(second, Err(Error::InvalidChainUsage { .. })));
                        // Swallows the violation on purpose.
                        first
                    }
                    Act::Fail => Err(HandlerError::new(self.name)
                        .with_status(StatusCode::CONFLICT)
                        .into()),
                    Act::Recover => match next.run(ctx).await {
                        Err(e) => Ok(Outcome::Response(e.into_response())),
                        ok => ok,
                    },
                };
                self.note("out");
                outcome
            })
        }
    }

    fn context() -> RequestContext {
        let req = http::Request::builder().uri("/").body(Bytes::new()).unwrap();
        RequestContext::new(req.into())
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn links_nest_in_order() {
        let j = journal();
        let chain = Chain::new([Probe::link("a", Act::Pass, &j), Probe::link("b", Act::Pass, &j)]);
        assert_eq!(chain.state(), ChainState::NotStarted);

        let outcome = chain.invoke(&mut context()).await.unwrap();

        assert!(outcome.is_end_of_chain());
        assert_eq!(entries(&j), ["a:in", "b:in", "b:out", "a:out"]);
        assert_eq!(chain.state(), ChainState::Completed);
    }

    #[tokio::test]
    async fn short_circuit_never_reaches_downstream() {
        let j = journal();
        let chain = Chain::new([
            Probe::link("a", Act::Pass, &j),
            Probe::link("guard", Act::ShortCircuit, &j),
            Probe::link("spy", Act::Pass, &j),
        ]);

        let outcome = chain.invoke(&mut context()).await.unwrap();

        let Outcome::Response(res) = outcome else { panic!("expected a response") };
        assert_eq!(&res.body()[..], b"guard");
        assert!(!entries(&j).iter().any(|e| e.starts_with("spy")));
        assert_eq!(chain.state(), ChainState::ShortCircuited);
    }

    #[tokio::test]
    async fn delegating_twice_fails_the_chain() {
        let j = journal();
        let chain = Chain::new([
            Probe::link("greedy", Act::DelegateTwice, &j),
            Probe::link("spy", Act::Pass, &j),
        ]);

        let err = chain.invoke(&mut context()).await.unwrap_err();

        assert!(matches!(err, Error::InvalidChainUsage { ref identity, .. } if identity == "greedy"));
        assert_eq!(entries(&j).iter().filter(|e| *e == "spy:in").count(), 1);
        assert_eq!(chain.state(), ChainState::Errored);
    }

    #[tokio::test]
    async fn errors_skip_the_rest_and_surface() {
        let j = journal();
        let chain = Chain::new([
            Probe::link("a", Act::Pass, &j),
            Probe::link("boom", Act::Fail, &j),
            Probe::link("spy", Act::Pass, &j),
        ]);

        let err = chain.invoke(&mut context()).await.unwrap_err();

        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(entries(&j), ["a:in", "boom:in", "boom:out", "a:out"]);
        assert_eq!(chain.state(), ChainState::Errored);
    }

    #[tokio::test]
    async fn upstream_link_may_recover() {
        let j = journal();
        let chain = Chain::new([
            Probe::link("net", Act::Recover, &j),
            Probe::link("boom", Act::Fail, &j),
        ]);

        let outcome = chain.invoke(&mut context()).await.unwrap();

        let Outcome::Response(res) = outcome else { panic!("expected a response") };
        assert_eq!(res.status_code(), StatusCode::CONFLICT);
        // Recovered, but the end of the chain was never reached.
        assert_eq!(chain.state(), ChainState::ShortCircuited);
    }

    #[tokio::test]
    async fn empty_chain_completes() {
        let chain = Chain::new(Vec::<(&str, Arc<dyn Interceptor>)>::new());
        assert!(chain.invoke(&mut context()).await.unwrap().is_end_of_chain());
        assert_eq!(chain.state(), ChainState::Completed);
    }

    #[tokio::test]
    async fn chain_runs_once() {
        let j = journal();
        let chain = Chain::new([Probe::link("a", Act::Pass, &j)]);
        chain.invoke(&mut context()).await.unwrap();

        let err = chain.invoke(&mut context()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidChainUsage { .. }));
        assert_eq!(entries(&j), ["a:in", "a:out"]);
    }

    #[tokio::test]
    async fn closures_take_part() {
        let stamp = from_fn(|ctx, next| {
            Box::pin(async move {
                ctx.extensions_mut().insert("stamped");
                next.run(ctx).await
            })
        });
        let read = from_fn(|ctx, _next| {
            Box::pin(async move {
                let seen = ctx.extensions().get::<&str>().copied().unwrap_or("missing");
                Outcome::respond(seen)
            })
        });
        let chain = Chain::new([
            ("stamp", Arc::new(stamp) as Arc<dyn Interceptor>),
            ("read", Arc::new(read) as Arc<dyn Interceptor>),
        ]);

        let Outcome::Response(res) = chain.invoke(&mut context()).await.unwrap() else {
            panic!("expected a response")
        };
        assert_eq!(&res.body()[..], b"stamped");
    }
}
