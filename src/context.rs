//! Per-request state shared by every link of one chain.
//!
//! A [`RequestContext`] is created once per inbound request and owned by the
//! single chain processing it. The in-progress response lives behind a
//! [`ResponseWriter`], a cheap handle that callback-style handlers may clone
//! into spawned tasks. Ending or aborting the response fires its close
//! listeners exactly once; that is the signal the legacy adapter races
//! against.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{Extensions, HeaderMap, StatusCode};
use tracing::trace;

use crate::request::Request;
use crate::response::Response;

/// How a response stopped accepting writes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    /// The response was written and ended.
    Finished,
    /// The response was abandoned, e.g. the connection went away.
    Aborted,
}

// ── RequestContext ────────────────────────────────────────────────────────────

/// Mutable, request-scoped bag passed down the chain.
pub struct RequestContext {
    request: Request,
    response: ResponseWriter,
    extensions: Extensions,
    remote_addr: Option<SocketAddr>,
}

impl RequestContext {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: ResponseWriter::new(),
            extensions: Extensions::new(),
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn request(&self) -> &Request { &self.request }
    pub fn request_mut(&mut self) -> &mut Request { &mut self.request }
    pub fn response(&self) -> &ResponseWriter { &self.response }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Values stored here are visible to every later (and, on the way back
    /// out, every earlier) link of the same chain.
    pub fn extensions(&self) -> &Extensions { &self.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.extensions }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("termination", &self.response.termination())
            .finish_non_exhaustive()
    }
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

type CloseListener = Box<dyn FnOnce(Termination) + Send + 'static>;

/// Shared handle to the in-progress response.
///
/// All writes after [`end`](Self::end), [`send`](Self::send) or
/// [`abort`](Self::abort) are ignored and report `false`.
#[derive(Clone)]
pub struct ResponseWriter {
    inner: Arc<Mutex<Pending>>,
}

struct Pending {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    touched: bool,
    termination: Option<Termination>,
    listeners: Vec<CloseListener>,
}

impl ResponseWriter {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Pending {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: BytesMut::new(),
                touched: false,
                termination: None,
                listeners: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against the open response. Returns `false` once closed.
    fn write_with(&self, f: impl FnOnce(&mut Pending)) -> bool {
        let mut pending = self.lock();
        if pending.termination.is_some() {
            trace!("write after close ignored");
            return false;
        }
        pending.touched = true;
        f(&mut pending);
        true
    }

    pub fn set_status(&self, status: StatusCode) -> bool {
        self.write_with(|p| p.status = status)
    }

    /// Headers alone do not count as touching the response.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) -> bool {
        let mut pending = self.lock();
        if pending.termination.is_some() {
            return false;
        }
        pending.headers.insert(name, value);
        true
    }

    pub fn write(&self, chunk: impl AsRef<[u8]>) -> bool {
        self.write_with(|p| p.body.extend_from_slice(chunk.as_ref()))
    }

    /// Replaces the status and body written so far with `response` and ends
    /// it. Headers are merged: `response`'s win over staged ones of the same
    /// name, staged ones it does not set are kept.
    pub fn send(&self, response: Response) -> bool {
        let accepted = self.write_with(|p| {
            p.status = response.status;
            p.headers.extend(response.headers);
            p.body = BytesMut::from(&response.body[..]);
        });
        accepted && self.close(Termination::Finished)
    }

    pub fn end(&self) -> bool {
        self.close(Termination::Finished)
    }

    pub fn abort(&self) -> bool {
        self.close(Termination::Aborted)
    }

    pub fn status(&self) -> StatusCode {
        self.lock().status
    }

    pub fn is_closed(&self) -> bool {
        self.lock().termination.is_some()
    }

    pub fn termination(&self) -> Option<Termination> {
        self.lock().termination
    }

    /// Whether a status or body was written, even if the response is still open.
    pub fn is_touched(&self) -> bool {
        self.lock().touched
    }

    /// Registers `listener` to run once when the response closes.
    ///
    /// If the response is already closed the listener runs immediately.
    pub fn on_close(&self, listener: impl FnOnce(Termination) + Send + 'static) {
        let mut pending = self.lock();
        let termination = pending.termination;
        match termination {
            Some(termination) => {
                drop(pending);
                listener(termination);
            }
            None => pending.listeners.push(Box::new(listener)),
        }
    }

    /// Snapshot of what was written, as a [`Response`] value.
    pub fn to_response(&self) -> Response {
        let pending = self.lock();
        Response {
            body: Bytes::copy_from_slice(&pending.body),
            headers: pending.headers.clone(),
            status: pending.status,
        }
    }

    /// Copies staged headers onto `res` where it does not set them itself.
    pub(crate) fn merge_headers_into(&self, res: &mut Response) {
        let pending = self.lock();
        for name in pending.headers.keys() {
            if res.headers.contains_key(name) {
                continue;
            }
            for value in pending.headers.get_all(name) {
                res.headers.append(name.clone(), value.clone());
            }
        }
    }

    fn close(&self, termination: Termination) -> bool {
        let listeners = {
            let mut pending = self.lock();
            if pending.termination.is_some() {
                return false;
            }
            pending.termination = Some(termination);
            std::mem::take(&mut pending.listeners)
        };
        trace!(?termination, listeners = listeners.len(), "response closed");
        // Listeners run outside the lock so they may inspect the writer.
        for listener in listeners {
            listener(termination);
        }
        true
    }
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.lock();
        f.debug_struct("ResponseWriter")
            .field("status", &pending.status)
            .field("termination", &pending.termination)
            .finish_non_exhaustive()
    }
}
