//! Built-in interceptors.
//!
//! Register them like any other participant; the group decides where they
//! run. The default order `["cors", "apiSpec", ""]` already puts [`Cors`]
//! first. [`Trace`] should usually wrap everything, so list its group ahead
//! of the rest:
//!
//! ```rust
//! use std::sync::Arc;
//! use tsugi::{Participant, Pipeline, PipelineConfig, RegisterOptions, Registry};
//! use tsugi::middleware::{self, Cors, Trace};
//!
//! let registry = Arc::new(Registry::new());
//! registry.register(
//!     Participant::native(Trace),
//!     RegisterOptions::new().group(middleware::TRACE_GROUP),
//! );
//! registry.register(
//!     Participant::native(Cors::permissive()),
//!     RegisterOptions::new().group(middleware::CORS_GROUP),
//! );
//!
//! let config = PipelineConfig::default().ordered_groups(["trace", "cors", "apiSpec", ""]);
//! let pipeline = Pipeline::new(registry).with_config(config);
//! ```

mod cors;
mod trace;

pub use cors::{CORS_GROUP, Cors};
pub use trace::{TRACE_GROUP, Trace};
