//! Bridges callback-style handlers into the interceptor chain.
//!
//! A legacy handler does not receive `next`. It gets a [`Done`] callback and
//! finishes in one of three ways, possibly long after `handle` has returned:
//!
//! - `done.proceed()`: the chain continues downstream;
//! - `done.fail(err)` or returning `Err`: the chain fails with
//!   [`Error::Handler`];
//! - ending or aborting the response through the
//!   [`ResponseWriter`](crate::ResponseWriter), without calling `done`: the
//!   handler produced the response and the chain stops here.
//!
//! The adapter races the callback against the response's close signal. The
//! first settlement is latched; every later one is ignored, so `next` runs at
//! most once and an error is reported at most once.
//!
//! There is no timeout at this layer. A handler that neither calls `done`
//! nor closes the response stalls its request; wrap the pipeline call in
//! `tokio::time::timeout` if that matters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::chain::{BoxFuture, ChainResult, Interceptor, Next, Outcome};
use crate::context::{RequestContext, Termination};
use crate::error::{Error, HandlerError};

/// A callback-style participant.
///
/// `handle` must not block. Long-running work belongs in a spawned task
/// that owns `done` and, if needed, a clone of `ctx.response()`.
pub trait LegacyHandler: Send + Sync + 'static {
    fn handle(&self, ctx: &mut RequestContext, done: Done) -> Result<(), HandlerError>;
}

/// Builds a [`LegacyHandler`] from a closure.
///
/// ```rust
/// use tsugi::{Participant, legacy};
///
/// let handler = legacy::from_fn(|ctx, done| {
///     if ctx.request().header("x-api-key").is_some() {
///         done.proceed();
///     } else {
///         ctx.response().set_status(http::StatusCode::UNAUTHORIZED);
///         ctx.response().end();
///     }
///     Ok(())
/// });
/// let participant = Participant::legacy(handler);
/// ```
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: Fn(&mut RequestContext, Done) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FromFn(f)
}

/// See [`from_fn`].
pub struct FromFn<F>(F);

impl<F> LegacyHandler for FromFn<F>
where
    F: Fn(&mut RequestContext, Done) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, ctx: &mut RequestContext, done: Done) -> Result<(), HandlerError> {
        (self.0)(ctx, done)
    }
}

// ── Latch ─────────────────────────────────────────────────────────────────────

enum Signal {
    Proceed,
    Failed(HandlerError),
    Closed(Termination),
}

enum State {
    Pending,
    Settled(Signal),
    Observed,
}

/// Pending handler state: the first signal wins, the rest are dropped.
struct Latch {
    state: Mutex<State>,
    notify: Notify,
    /// Set when the handler's `Done` was dropped without being used.
    abandoned: AtomicBool,
}

impl Latch {
    fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            notify: Notify::new(),
            abandoned: AtomicBool::new(false),
        }
    }

    /// Nothing can settle the latch now except the response closing later.
    fn stalled(&self) -> bool {
        self.abandoned.load(Ordering::Acquire) && matches!(*self.lock(), State::Pending)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, signal: Signal) -> bool {
        let mut state = self.lock();
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Settled(signal);
        drop(state);
        // A stored permit covers a waiter that has not polled yet.
        self.notify.notify_one();
        true
    }

    async fn wait(&self) -> Signal {
        loop {
            {
                let mut state = self.lock();
                if matches!(*state, State::Settled(_)) {
                    if let State::Settled(signal) = std::mem::replace(&mut *state, State::Observed) {
                        return signal;
                    }
                }
            }
            self.notify.notified().await;
        }
    }
}

// ── Done ──────────────────────────────────────────────────────────────────────

/// Completion callback handed to a [`LegacyHandler`].
///
/// Consumed on use, so a handler can signal through it at most once.
/// Dropping it unused leaves the adapter waiting for the response to close.
pub struct Done {
    latch: Option<Arc<Latch>>,
    identity: Arc<str>,
}

impl Done {
    /// Continue with the rest of the chain.
    pub fn proceed(mut self) {
        if let Some(latch) = self.latch.take() {
            if !latch.settle(Signal::Proceed) {
                trace!(handler = %self.identity, "late proceed ignored");
            }
        }
    }

    /// Fail the chain with `err`.
    pub fn fail(mut self, err: HandlerError) {
        if let Some(latch) = self.latch.take() {
            if !latch.settle(Signal::Failed(err)) {
                trace!(handler = %self.identity, "late failure ignored");
            }
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if let Some(latch) = self.latch.take() {
            trace!(handler = %self.identity, "completion callback dropped unused");
            latch.abandoned.store(true, Ordering::Release);
        }
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

/// Wraps `handler` so it can take part in a chain as `identity`.
pub fn adapt(identity: impl Into<Arc<str>>, handler: Arc<dyn LegacyHandler>) -> LegacyAdapter {
    LegacyAdapter { identity: identity.into(), handler }
}

/// A [`LegacyHandler`] running as an [`Interceptor`]. See [`adapt`].
pub struct LegacyAdapter {
    identity: Arc<str>,
    handler: Arc<dyn LegacyHandler>,
}

impl Interceptor for LegacyAdapter {
    fn intercept<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult> {
        Box::pin(async move {
            let latch = Arc::new(Latch::new());

            // Subscribe before the handler runs: it may close the response
            // synchronously inside `handle`.
            let listener = Arc::downgrade(&latch);
            ctx.response().on_close(move |termination| {
                if let Some(latch) = listener.upgrade() {
                    latch.settle(Signal::Closed(termination));
                }
            });

            if let Some(termination) = ctx.response().termination() {
                debug!(handler = %self.identity, ?termination, "response already closed, handler skipped");
                return Ok(Outcome::Closed(termination));
            }

            let done = Done {
                latch: Some(Arc::clone(&latch)),
                identity: Arc::clone(&self.identity),
            };
            if let Err(err) = self.handler.handle(ctx, done) {
                latch.settle(Signal::Failed(err));
            }
            if latch.stalled() {
                warn!(
                    handler = %self.identity,
                    "completion callback dropped unused; waiting on the response to close"
                );
            }

            match latch.wait().await {
                Signal::Proceed => {
                    trace!(handler = %self.identity, "handler proceeded");
                    next.run(ctx).await
                }
                Signal::Closed(termination) => {
                    debug!(handler = %self.identity, ?termination, "handler closed the response");
                    Ok(Outcome::Closed(termination))
                }
                Signal::Failed(err) => {
                    debug!(handler = %self.identity, error = %err, "handler failed");
                    Err(Error::Handler(err))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use http::StatusCode;

    use super::*;
    use crate::chain::Chain;
    use crate::response::Response;

    /// Downstream link that answers and counts how often it ran.
    struct Spy(Arc<AtomicUsize>);

    impl Interceptor for Spy {
        fn intercept<'a>(
            &'a self,
            _ctx: &'a mut RequestContext,
            _next: Next<'a>,
        ) -> BoxFuture<'a, ChainResult> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
                Outcome::respond("downstream")
            })
        }
    }

    fn context() -> RequestContext {
        let req = http::Request::builder().uri("/legacy").body(Bytes::new()).unwrap();
        RequestContext::new(req.into())
    }

    /// `[legacy handler, spy]`, plus the spy's hit counter.
    fn chain_with(handler: impl LegacyHandler) -> (Chain, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let chain = Chain::new([
            ("legacy", Arc::new(adapt("legacy", Arc::new(handler))) as Arc<dyn Interceptor>),
            ("spy", Arc::new(Spy(Arc::clone(&hits))) as Arc<dyn Interceptor>),
        ]);
        (chain, hits)
    }

    fn body_of(outcome: Outcome) -> Bytes {
        match outcome {
            Outcome::Response(res) => res.body().clone(),
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn proceed_runs_downstream_once() {
        let (chain, hits) = chain_with(from_fn(|_ctx, done| {
            done.proceed();
            Ok(())
        }));

        let outcome = chain.invoke(&mut context()).await.unwrap();

        assert_eq!(body_of(outcome), "downstream");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closing_the_response_stops_the_chain() {
        let (chain, hits) = chain_with(from_fn(|ctx, _done| {
            ctx.response().send(Response::text("legacy"));
            Ok(())
        }));
        let mut ctx = context();

        let outcome = chain.invoke(&mut ctx).await.unwrap();

        assert!(matches!(outcome, Outcome::Closed(Termination::Finished)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(&ctx.response().to_response().body()[..], b"legacy");
    }

    #[tokio::test]
    async fn close_then_proceed_keeps_the_close() {
        let (chain, hits) = chain_with(from_fn(|ctx, done| {
            ctx.response().end();
            done.proceed();
            Ok(())
        }));

        let outcome = chain.invoke(&mut context()).await.unwrap();

        assert!(matches!(outcome, Outcome::Closed(Termination::Finished)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn proceed_then_close_keeps_the_proceed() {
        let (chain, hits) = chain_with(from_fn(|ctx, done| {
            done.proceed();
            ctx.response().end();
            Ok(())
        }));

        let outcome = chain.invoke(&mut context()).await.unwrap();

        assert_eq!(body_of(outcome), "downstream");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_then_close_reports_once() {
        let (chain, hits) = chain_with(from_fn(|ctx, done| {
            done.fail(HandlerError::new("denied").with_status(StatusCode::FORBIDDEN));
            ctx.response().end();
            Err(HandlerError::new("thrown after failing"))
        }));

        let err = chain.invoke(&mut context()).await.unwrap_err();

        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "denied");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn thrown_error_propagates() {
        let (chain, hits) = chain_with(from_fn(|_ctx, _done| Err(HandlerError::new("thrown"))));

        let err = chain.invoke(&mut context()).await.unwrap_err();

        assert!(matches!(err, Error::Handler(ref e) if e.message() == "thrown"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_from_a_spawned_task() {
        let (chain, hits) = chain_with(from_fn(|_ctx, done| {
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                done.proceed();
            });
            Ok(())
        }));

        let outcome = chain.invoke(&mut context()).await.unwrap();

        assert_eq!(body_of(outcome), "downstream");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_from_a_spawned_task() {
        let (chain, hits) = chain_with(from_fn(|ctx, done| {
            let response = ctx.response().clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                response.abort();
                // Too late: the abort already won.
                done.proceed();
            });
            Ok(())
        }));

        let outcome = chain.invoke(&mut context()).await.unwrap();

        assert!(matches!(outcome, Outcome::Closed(Termination::Aborted)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn already_closed_response_skips_the_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handler = from_fn(move |_ctx, done| {
            seen.fetch_add(1, Ordering::SeqCst);
            done.proceed();
            Ok(())
        });
        let closer = crate::chain::from_fn(|ctx, next| {
            Box::pin(async move {
                ctx.response().end();
                next.run(ctx).await
            })
        });
        let chain = Chain::new([
            ("closer", Arc::new(closer) as Arc<dyn Interceptor>),
            ("legacy", Arc::new(adapt("legacy", Arc::new(handler))) as Arc<dyn Interceptor>),
        ]);

        let outcome = chain.invoke(&mut context()).await.unwrap();

        assert!(matches!(outcome, Outcome::Closed(Termination::Finished)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn silent_handler_hangs() {
        let (chain, hits) = chain_with(from_fn(|_ctx, _done| Ok(())));
        let mut ctx = context();

        let waited = tokio::time::timeout(Duration::from_millis(20), chain.invoke(&mut ctx)).await;

        assert!(waited.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_done_then_closing_finishes() {
        let (chain, hits) = chain_with(from_fn(|ctx, done| {
            drop(done);
            ctx.response().end();
            Ok(())
        }));

        let outcome = chain.invoke(&mut context()).await.unwrap();

        assert!(matches!(outcome, Outcome::Closed(Termination::Finished)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn only_an_unsettled_abandoned_latch_is_stalled() {
        let latch = Arc::new(Latch::new());
        assert!(!latch.stalled());

        drop(Done { latch: Some(Arc::clone(&latch)), identity: "h".into() });
        assert!(latch.stalled());

        latch.settle(Signal::Closed(Termination::Finished));
        assert!(!latch.stalled());
    }
}
