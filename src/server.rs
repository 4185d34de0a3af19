//! HTTP host and graceful shutdown.
//!
//! Every request gets a fresh [`RequestContext`] and one run of the
//! [`Pipeline`]. The outcome becomes the HTTP response:
//!
//! | Outcome                          | Sent                                  |
//! |----------------------------------|---------------------------------------|
//! | `Response(res)`                  | `res`                                 |
//! | `Closed(Finished)`               | whatever was written to the writer    |
//! | `EndOfChain`, writer touched     | whatever was written to the writer    |
//! | `EndOfChain`, writer untouched   | `404 Not Found`                       |
//! | `Err(e)`                         | `e.into_response()`                   |
//! | response aborted                 | nothing; the connection is dropped    |
//! | body over the size limit         | `413 Payload Too Large`, no pipeline  |
//!
//! Headers staged on the writer (CORS, request ids) are added to whatever is
//! sent unless the rendered response sets the same header itself.
//!
//! If the client goes away mid-request, hyper drops the request future and
//! the chain with it, at whatever link it was suspended in.
//!
//! # Shutdown
//!
//! On SIGTERM or Ctrl-C the server stops accepting, lets in-flight
//! connections finish, then returns from [`Server::serve`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainResult, Outcome};
use crate::context::{RequestContext, ResponseWriter, Termination};
use crate::error::Error;
use crate::pipeline::Pipeline;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// Request bodies larger than this are refused with 413.
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// The HTTP server.
pub struct Server {
    listener: std::net::TcpListener,
    addr: SocketAddr,
    max_body_bytes: usize,
}

impl Server {
    /// Binds `addr` right away; connections queue until
    /// [`serve`](Server::serve) starts accepting. Port `0` picks a free one,
    /// see [`local_addr`](Server::local_addr).
    ///
    /// ```rust,no_run
    /// # fn main() -> Result<(), tsugi::Error> {
    /// let server = tsugi::Server::bind("0.0.0.0:3000")?;
    /// # Ok(()) }
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr, max_body_bytes: DEFAULT_MAX_BODY_BYTES })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr { self.addr }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Serves until SIGTERM or Ctrl-C, then drains in-flight connections.
    pub async fn serve(self, pipeline: Pipeline) -> Result<(), Error> {
        self.serve_with_shutdown(pipeline, shutdown_signal()).await
    }

    /// Serves until `shutdown` resolves, then drains in-flight connections.
    pub async fn serve_with_shutdown(
        self,
        pipeline: Pipeline,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let listener = TcpListener::from_std(self.listener)?;
        let pipeline = Arc::new(pipeline);
        let max_body_bytes = self.max_body_bytes;

        info!(addr = %self.addr, "tsugi listening");

        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Check shutdown first so a signal stops accepting at once.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let pipeline = Arc::clone(&pipeline);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let pipeline = Arc::clone(&pipeline);
                            async move { dispatch(pipeline, req, remote_addr, max_body_bytes).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            debug!(peer = %remote_addr, "connection closed: {e}");
                        }
                    });
                }

                // Reap finished connection tasks.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("tsugi stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Runs the pipeline for one request and renders its outcome.
///
/// Returning `Err` makes hyper drop the connection; that only happens for
/// aborted responses.
async fn dispatch(
    pipeline: Arc<Pipeline>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
    max_body_bytes: usize,
) -> Result<http::Response<Full<Bytes>>, Error> {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            debug!(peer = %remote_addr, limit = max_body_bytes, "request body too large");
            return Ok(Response::status(StatusCode::PAYLOAD_TOO_LARGE).into_inner());
        }
        Err(e) => {
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            return Ok(Response::status(StatusCode::BAD_REQUEST).into_inner());
        }
    };

    let mut ctx = RequestContext::new(Request::from_parts(parts, body)).with_remote_addr(remote_addr);
    let result = pipeline.run(&mut ctx).await;

    if ctx.response().termination() == Some(Termination::Aborted) {
        debug!(peer = %remote_addr, "response aborted, dropping connection");
        return Err(Error::Aborted);
    }

    if let Err(e) = &result {
        if e.status().is_server_error() {
            error!(peer = %remote_addr, error = %e, "pipeline failed");
        } else {
            debug!(peer = %remote_addr, error = %e, "pipeline rejected request");
        }
    }

    Ok(render(result, ctx.response()).into_inner())
}

/// Maps a chain result onto the response to send, per the table above.
fn render(result: ChainResult, writer: &ResponseWriter) -> Response {
    let mut response = match result {
        Ok(Outcome::Closed(_)) => return writer.to_response(),
        Ok(Outcome::EndOfChain) if writer.is_touched() || writer.is_closed() => {
            return writer.to_response();
        }
        Ok(Outcome::Response(res)) => res,
        Ok(Outcome::EndOfChain) => Response::status(StatusCode::NOT_FOUND),
        Err(e) => e.into_response(),
    };
    writer.merge_headers_into(&mut response);
    response
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or SIGINT (Ctrl-C only on non-Unix).
///
/// A signal that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
