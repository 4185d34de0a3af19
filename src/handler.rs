//! Route handler trait and type erasure.
//!
//! The [`Router`](crate::Router) stores handlers of different concrete types
//! in one radix tree, so each is erased behind `dyn ErasedHandler`:
//!
//! ```text
//! async fn hello(req: Request) -> Response { … }   ← user writes this
//!        ↓ router.on(Method::GET, "/", hello)
//! hello.into_boxed_handler()                       ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                       stored as BoxedHandler
//!        ↓
//! handler.call(req)                                ← one vtable dispatch
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::chain::BoxFuture;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` because it appears in the return type of
/// [`Handler::into_boxed_handler`].
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture<'static, Response>;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every `async fn(Request) -> impl IntoResponse`.
///
/// Sealed: only the blanket impl below satisfies it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Response> {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}
