//! Discovery of interceptors by extension point.
//!
//! The pipeline never holds a static list of interceptors. It asks an
//! [`EntrySource`] for the entries bound to a named extension point and gets
//! back an owned snapshot; registrations made afterwards only affect later
//! requests.
//!
//! [`Registry`] is the in-memory source used by the host and by setup code:
//!
//! ```rust
//! use tsugi::{Participant, RegisterOptions, Registry, middleware::Cors};
//!
//! let registry = Registry::new();
//! let handle = registry.register(
//!     Participant::native(Cors::permissive()),
//!     RegisterOptions::new().group("cors").key("cors"),
//! );
//! assert_eq!(handle.key(), "cors");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::chain::Interceptor;
use crate::error::Error;
use crate::legacy::{self, LegacyHandler};

/// Extension point used when none is named.
pub const DEFAULT_EXTENSION_POINT: &str = "middleware";

/// Group assigned to entries registered without one.
pub const DEFAULT_GROUP: &str = "middleware";

// ── Participant ───────────────────────────────────────────────────────────────

/// The shapes an entry's callable may take.
///
/// Only [`InterceptorEntry::interceptor`] looks inside: legacy handlers are
/// wrapped there and nowhere else.
#[derive(Clone)]
pub enum Participant {
    /// Written against `(context, next)` directly.
    Native(Arc<dyn Interceptor>),
    /// Completes through a [`Done`](crate::Done) callback or by closing the
    /// response itself.
    Legacy(Arc<dyn LegacyHandler>),
}

impl Participant {
    pub fn native(interceptor: impl Interceptor) -> Self {
        Self::Native(Arc::new(interceptor))
    }

    pub fn legacy(handler: impl LegacyHandler) -> Self {
        Self::Legacy(Arc::new(handler))
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(_) => f.write_str("Native"),
            Self::Legacy(_) => f.write_str("Legacy"),
        }
    }
}

// ── InterceptorEntry ──────────────────────────────────────────────────────────

/// An immutable registration: who it is, where it sorts, what it runs.
#[derive(Clone, Debug)]
pub struct InterceptorEntry {
    identity: Arc<str>,
    group: Arc<str>,
    participant: Participant,
}

impl InterceptorEntry {
    pub fn new(
        identity: impl Into<Arc<str>>,
        group: impl Into<Arc<str>>,
        participant: Participant,
    ) -> Self {
        Self {
            identity: identity.into(),
            group: group.into(),
            participant,
        }
    }

    pub fn identity(&self) -> &str { &self.identity }
    pub fn group(&self) -> &str { &self.group }
    pub fn participant(&self) -> &Participant { &self.participant }

    pub(crate) fn shared_identity(&self) -> Arc<str> {
        Arc::clone(&self.identity)
    }

    /// The chain-compatible callable for this entry.
    pub fn interceptor(&self) -> Arc<dyn Interceptor> {
        match &self.participant {
            Participant::Native(interceptor) => Arc::clone(interceptor),
            Participant::Legacy(handler) => Arc::new(legacy::adapt(
                Arc::clone(&self.identity),
                Arc::clone(handler),
            )),
        }
    }
}

// ── EntrySource ───────────────────────────────────────────────────────────────

/// Anything that can enumerate the entries bound to an extension point.
///
/// Implementations return a snapshot and must not have side effects visible
/// to the caller. Order is discovery order; sorting happens afterwards.
pub trait EntrySource: Send + Sync + 'static {
    fn find_entries(&self, extension_point: &str) -> Result<Vec<InterceptorEntry>, Error>;
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Options for [`Registry::register`].
#[derive(Clone, Debug, Default)]
pub struct RegisterOptions {
    group: Option<String>,
    extension_point: Option<String>,
    key: Option<String>,
}

impl RegisterOptions {
    pub fn new() -> Self { Self::default() }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn extension_point(mut self, name: impl Into<String>) -> Self {
        self.extension_point = Some(name.into());
        self
    }

    /// Stable identity. Registering the same key twice on one extension
    /// point replaces the earlier entry, keeping its position.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Returned by [`Registry::register`]; pass to [`Registry::unregister`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistrationHandle {
    extension_point: String,
    key: Arc<str>,
}

impl RegistrationHandle {
    pub fn extension_point(&self) -> &str { &self.extension_point }
    pub fn key(&self) -> &str { &self.key }
}

/// In-memory, thread-safe [`EntrySource`].
///
/// Read-mostly: every request takes a read lock long enough to clone the
/// entry list of one extension point.
#[derive(Default)]
pub struct Registry {
    points: RwLock<HashMap<String, Vec<InterceptorEntry>>>,
    seq: AtomicU64,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, participant: Participant, options: RegisterOptions) -> RegistrationHandle {
        let extension_point = options
            .extension_point
            .unwrap_or_else(|| DEFAULT_EXTENSION_POINT.to_owned());
        let key: Arc<str> = match options.key {
            Some(key) => key.into(),
            None => {
                let n = self.seq.fetch_add(1, Ordering::Relaxed);
                format!("{extension_point}.{n}").into()
            }
        };
        let group = options.group.unwrap_or_else(|| DEFAULT_GROUP.to_owned());
        let entry = InterceptorEntry::new(Arc::clone(&key), group, participant);

        let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
        let entries = points.entry(extension_point.clone()).or_default();
        match entries.iter_mut().find(|e| e.identity == key) {
            Some(existing) => {
                debug!(%extension_point, %key, "replacing interceptor");
                *existing = entry;
            }
            None => {
                debug!(%extension_point, %key, group = %entry.group, "registering interceptor");
                entries.push(entry);
            }
        }

        RegistrationHandle { extension_point, key }
    }

    /// Removes a registration. Returns `false` if it was already gone.
    pub fn unregister(&self, handle: &RegistrationHandle) -> bool {
        let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = points.get_mut(&handle.extension_point) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.identity != handle.key);
        let removed = entries.len() != before;
        if removed {
            debug!(extension_point = %handle.extension_point, key = %handle.key, "unregistered interceptor");
        }
        removed
    }
}

impl EntrySource for Registry {
    fn find_entries(&self, extension_point: &str) -> Result<Vec<InterceptorEntry>, Error> {
        let points = self.points.read().map_err(|e| Error::Discovery {
            extension_point: extension_point.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(points.get(extension_point).cloned().unwrap_or_default())
    }
}
