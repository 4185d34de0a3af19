//! Per-request span with method, path, status and latency.

use std::time::Instant;

use tracing::{Instrument, info, info_span, warn};

use crate::chain::{BoxFuture, ChainResult, Interceptor, Next, Outcome};
use crate::context::RequestContext;

pub const TRACE_GROUP: &str = "trace";

/// Wraps everything downstream in an `info` span and logs how it ended.
pub struct Trace;

impl Interceptor for Trace {
    fn intercept<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult> {
        let span = info_span!(
            "request",
            method = %ctx.request().method(),
            path = %ctx.request().path()
        );

        Box::pin(
            async move {
                let started = Instant::now();
                let result = next.run(ctx).await;
                let latency_us = started.elapsed().as_micros() as u64;

                match &result {
                    Ok(Outcome::Response(res)) => {
                        info!(status = res.status_code().as_u16(), latency_us, "request finished");
                    }
                    Ok(Outcome::Closed(termination)) => {
                        let status = ctx.response().status().as_u16();
                        info!(status, ?termination, latency_us, "response closed");
                    }
                    Ok(Outcome::EndOfChain) => {
                        info!(latency_us, "end of chain reached");
                    }
                    Err(e) => {
                        warn!(status = e.status().as_u16(), error = %e, latency_us, "request failed");
                    }
                }
                result
            }
            .instrument(span),
        )
    }
}
