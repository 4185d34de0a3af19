//! Minimal tsugi service: tracing, CORS, a callback-style API-key check and
//! a router, all discovered from one registry.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/users/42 -H 'x-api-key: demo'
//!   curl -i http://localhost:3000/users/42                     # 401 from the legacy check
//!   curl -i -X OPTIONS http://localhost:3000/users/42 \
//!        -H 'origin: https://example.com' -H 'access-control-request-method: GET'

use std::sync::Arc;

use http::{Method, StatusCode};
use tsugi::middleware::{CORS_GROUP, Cors, TRACE_GROUP, Trace};
use tsugi::{
    Participant, Pipeline, PipelineConfig, ROUTE_GROUP, RegisterOptions, Registry, Request,
    Response, Router, Server, legacy,
};

#[tokio::main]
async fn main() -> Result<(), tsugi::Error> {
    tracing_subscriber::fmt::init();

    let registry = Arc::new(Registry::new());

    registry.register(Participant::native(Trace), RegisterOptions::new().group(TRACE_GROUP));
    registry.register(
        Participant::native(Cors::permissive()),
        RegisterOptions::new().group(CORS_GROUP),
    );

    // Written in callback style: either calls `done` or ends the response.
    registry.register(
        Participant::legacy(legacy::from_fn(|ctx, done| {
            if ctx.request().header("x-api-key") == Some("demo") {
                done.proceed();
            } else {
                ctx.response().send(
                    Response::builder()
                        .status(StatusCode::UNAUTHORIZED)
                        .text("missing or wrong x-api-key"),
                );
            }
            Ok(())
        })),
        RegisterOptions::new().group("auth").key("api-key"),
    );

    let router = Router::new()
        .on(Method::GET, "/users/{id}", get_user)
        .on(Method::DELETE, "/users/{id}", delete_user);
    registry.register(Participant::native(router), RegisterOptions::new().group(ROUTE_GROUP));

    let config = PipelineConfig::default()
        .ordered_groups([TRACE_GROUP, CORS_GROUP, "apiSpec", "auth", ROUTE_GROUP, ""]);

    Server::bind("0.0.0.0:3000")?
        .serve(Pipeline::new(registry).with_config(config))
        .await
}

// GET /users/{id}
async fn get_user(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json(format!(r#"{{"id":"{id}","name":"alice"}}"#))
}

// DELETE /users/{id} → 204 No Content
async fn delete_user(_req: Request) -> StatusCode {
    StatusCode::NO_CONTENT
}
