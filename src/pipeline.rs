//! The pipeline invoker: discover, order, run.
//!
//! ```text
//! Pipeline::run(ctx)
//!   1. source.find_entries(extension_point)   snapshot, discovery order
//!   2. order::resolve(entries, ordered_groups) pure, stable
//!   3. entry.interceptor()                     legacy handlers wrapped here
//!   4. Chain::new(..).invoke(ctx)
//! ```
//!
//! A [`Pipeline`] holds nothing but its entry source and default options,
//! so one instance serves every request.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::chain::{Chain, ChainResult};
use crate::context::RequestContext;
use crate::error::Error;
use crate::order::{self, DEFAULT_ORDERED_GROUPS};
use crate::registry::{DEFAULT_EXTENSION_POINT, EntrySource};

/// Defaults applied when a call does not override them.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    extension_point: String,
    ordered_groups: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extension_point: DEFAULT_EXTENSION_POINT.to_owned(),
            ordered_groups: DEFAULT_ORDERED_GROUPS.iter().map(|g| (*g).to_owned()).collect(),
        }
    }
}

impl PipelineConfig {
    pub fn extension_point(mut self, name: impl Into<String>) -> Self {
        self.extension_point = name.into();
        self
    }

    pub fn ordered_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordered_groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

/// Per-call overrides for [`Pipeline::run_with`].
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    extension_point: Option<String>,
    ordered_groups: Option<Vec<String>>,
}

impl RunOptions {
    pub fn new() -> Self { Self::default() }

    pub fn extension_point(mut self, name: impl Into<String>) -> Self {
        self.extension_point = Some(name.into());
        self
    }

    pub fn ordered_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordered_groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }
}

/// Entry point for running the interceptors of one extension point.
#[derive(Clone)]
pub struct Pipeline {
    source: Arc<dyn EntrySource>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(source: Arc<dyn EntrySource>) -> Self {
        Self { source, config: PipelineConfig::default() }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PipelineConfig { &self.config }

    /// Runs the default extension point with the default group order.
    pub async fn run(&self, ctx: &mut RequestContext) -> ChainResult {
        self.run_with(ctx, RunOptions::default()).await
    }

    pub async fn run_with(&self, ctx: &mut RequestContext, options: RunOptions) -> ChainResult {
        let chain = self.plan(&options)?;
        chain.invoke(ctx).await
    }

    /// Discovers and orders the entries for `options`, without running them.
    ///
    /// Fails with [`Error::Discovery`] if the source cannot enumerate the
    /// extension point; no chain is built in that case.
    pub fn plan(&self, options: &RunOptions) -> Result<Chain, Error> {
        let extension_point = options
            .extension_point
            .as_deref()
            .unwrap_or(&self.config.extension_point);
        let groups = options
            .ordered_groups
            .as_deref()
            .unwrap_or(&self.config.ordered_groups);

        let discovered = self.source.find_entries(extension_point)?;
        let ordered = order::resolve(&discovered, groups);
        trace!(
            %extension_point,
            order = ?ordered.iter().map(|e| e.identity()).collect::<Vec<_>>(),
            "resolved interceptor order"
        );

        let chain = Chain::new(ordered.iter().map(|e| (e.shared_identity(), e.interceptor())));
        debug!(%extension_point, links = chain.len(), "chain built");
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::chain::{BoxFuture, Interceptor, Next, Outcome};
    use crate::registry::{InterceptorEntry, Participant, RegisterOptions, Registry};

    type Journal = Arc<Mutex<Vec<&'static str>>>;

    struct Mark(&'static str, Journal);

    impl Interceptor for Mark {
        fn intercept<'a>(
            &'a self,
            ctx: &'a mut RequestContext,
            next: Next<'a>,
        ) -> BoxFuture<'a, ChainResult> {
            Box::pin(async move {
                self.1.lock().unwrap().push(self.0);
                next.run(ctx).await
            })
        }
    }

    struct Broken;

    impl EntrySource for Broken {
        fn find_entries(&self, extension_point: &str) -> Result<Vec<InterceptorEntry>, Error> {
            Err(Error::Discovery {
                extension_point: extension_point.to_owned(),
                reason: "backend unavailable".to_owned(),
            })
        }
    }

    fn context() -> RequestContext {
        let req = http::Request::builder().uri("/").body(Bytes::new()).unwrap();
        RequestContext::new(req.into())
    }

    fn register(registry: &Registry, journal: &Journal, key: &'static str, group: &str) {
        registry.register(
            Participant::native(Mark(key, Arc::clone(journal))),
            RegisterOptions::new().key(key).group(group),
        );
    }

    #[tokio::test]
    async fn runs_in_default_group_order() {
        let registry = Arc::new(Registry::new());
        let journal = Journal::default();
        register(&registry, &journal, "B", "");
        register(&registry, &journal, "C", "apiSpec");
        register(&registry, &journal, "A", "cors");

        let outcome = Pipeline::new(registry).run(&mut context()).await.unwrap();

        assert!(outcome.is_end_of_chain());
        assert_eq!(*journal.lock().unwrap(), ["A", "C", "B"]);
    }

    #[tokio::test]
    async fn options_override_point_and_order() {
        let registry = Arc::new(Registry::new());
        let journal = Journal::default();
        register(&registry, &journal, "A", "cors");
        registry.register(
            Participant::native(Mark("late", Arc::clone(&journal))),
            RegisterOptions::new().extension_point("auth").group("late"),
        );
        registry.register(
            Participant::native(Mark("early", Arc::clone(&journal))),
            RegisterOptions::new().extension_point("auth").group("early"),
        );

        let pipeline = Pipeline::new(registry);
        let options = RunOptions::new().extension_point("auth").ordered_groups(["early", "late"]);
        pipeline.run_with(&mut context(), options).await.unwrap();

        assert_eq!(*journal.lock().unwrap(), ["early", "late"]);
    }

    #[tokio::test]
    async fn configured_defaults_apply() {
        let registry = Arc::new(Registry::new());
        let journal = Journal::default();
        register(&registry, &journal, "x", "apiSpec");
        register(&registry, &journal, "y", "cors");

        let config = PipelineConfig::default().ordered_groups(["apiSpec", "cors"]);
        let pipeline = Pipeline::new(registry).with_config(config);
        pipeline.run(&mut context()).await.unwrap();

        assert_eq!(*journal.lock().unwrap(), ["x", "y"]);
    }

    #[tokio::test]
    async fn discovery_failure_builds_nothing() {
        let pipeline = Pipeline::new(Arc::new(Broken));

        let err = pipeline.run(&mut context()).await.unwrap_err();

        assert!(matches!(err, Error::Discovery { ref extension_point, .. } if extension_point == "middleware"));
    }

    /// Registers another interceptor while the chain is running.
    struct Registrar {
        registry: Arc<Registry>,
        journal: Journal,
    }

    impl Interceptor for Registrar {
        fn intercept<'a>(
            &'a self,
            ctx: &'a mut RequestContext,
            next: Next<'a>,
        ) -> BoxFuture<'a, ChainResult> {
            Box::pin(async move {
                self.journal.lock().unwrap().push("registrar");
                self.registry.register(
                    Participant::native(Mark("newcomer", Arc::clone(&self.journal))),
                    RegisterOptions::new().key("newcomer"),
                );
                next.run(ctx).await
            })
        }
    }

    #[tokio::test]
    async fn registrations_during_a_run_wait_for_the_next_request() {
        let registry = Arc::new(Registry::new());
        let journal = Journal::default();
        registry.register(
            Participant::native(Registrar { registry: Arc::clone(&registry), journal: Arc::clone(&journal) }),
            RegisterOptions::new().key("registrar"),
        );
        let pipeline = Pipeline::new(Arc::clone(&registry) as Arc<dyn EntrySource>);

        pipeline.run(&mut context()).await.unwrap();
        assert_eq!(*journal.lock().unwrap(), ["registrar"]);

        journal.lock().unwrap().clear();
        pipeline.run(&mut context()).await.unwrap();
        assert_eq!(*journal.lock().unwrap(), ["registrar", "newcomer"]);
    }

    #[tokio::test]
    async fn legacy_entries_are_wrapped() {
        let registry = Arc::new(Registry::new());
        registry.register(
            Participant::legacy(crate::legacy::from_fn(|ctx, _done| {
                ctx.response().send(crate::Response::text("from legacy"));
                Ok(())
            })),
            RegisterOptions::new().key("legacy"),
        );

        let mut ctx = context();
        let outcome = Pipeline::new(registry).run(&mut ctx).await.unwrap();

        assert!(matches!(outcome, Outcome::Closed(_)));
        assert_eq!(&ctx.response().to_response().body()[..], b"from legacy");
    }
}
