//! # tsugi
//!
//! Discoverable, ordered interceptor chains for HTTP services.
//!
//! Interceptors are not wired into a static stack. They are registered
//! against a named *extension point* with a *group* label, and each request
//! discovers the current set, orders it by group, and runs it as a chain of
//! nested continuations:
//!
//! ```text
//! Registry ──find_entries──▶ order::resolve ──▶ Chain ──▶ link₀ ▶ link₁ ▶ … ▶ EndOfChain
//!                                                        (native or legacy)
//! ```
//!
//! Each link either calls `next` once, answers on its own (short-circuit),
//! or fails. Callback-style handlers written against a `done` callback
//! take part through [`legacy::adapt`], which also notices when such a
//! handler finished the response itself.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use http::Method;
//! use tsugi::{Participant, Pipeline, RegisterOptions, Registry, Request, Response, Router, Server};
//! use tsugi::middleware::Cors;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tsugi::Error> {
//!     let registry = Arc::new(Registry::new());
//!     registry.register(
//!         Participant::native(Cors::permissive()),
//!         RegisterOptions::new().group("cors"),
//!     );
//!     registry.register(
//!         Participant::native(Router::new().on(Method::GET, "/users/{id}", get_user)),
//!         RegisterOptions::new().group("route"),
//!     );
//!
//!     Server::bind("0.0.0.0:3000")?.serve(Pipeline::new(registry)).await
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//! ```

mod context;
mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod chain;
pub mod legacy;
pub mod middleware;
pub mod order;
pub mod pipeline;
pub mod registry;

pub use chain::{BoxFuture, Chain, ChainResult, ChainState, Interceptor, Next, Outcome};
pub use context::{RequestContext, ResponseWriter, Termination};
pub use error::{Error, HandlerError};
pub use handler::Handler;
pub use legacy::{Done, LegacyHandler};
pub use pipeline::{Pipeline, PipelineConfig, RunOptions};
pub use registry::{
    EntrySource, InterceptorEntry, Participant, RegisterOptions, RegistrationHandle, Registry,
};
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::{ROUTE_GROUP, Router};
pub use server::{DEFAULT_MAX_BODY_BYTES, Server};
