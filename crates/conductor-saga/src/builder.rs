use std::fmt::Debug;
use std::sync::Arc;

use conductor_core::{Clock, TokioClock};

use crate::saga::Saga;
use crate::step::Step;
use crate::store::{MemorySagaLogStore, SagaLogStore};

/// Accumulating builder for a [`Saga`].
///
/// Steps run in the order they are added. Once built, the step list cannot
/// change.
///
/// ```
/// use conductor_saga::{SagaBuilder, Step};
///
/// #[derive(Default)]
/// struct Ctx {
///     branch: Option<String>,
/// }
///
/// let saga = SagaBuilder::<Ctx, std::io::Error>::new("review")
///     .add_step(Step::from_fn("checkout", |ctx: &mut Ctx| {
///         ctx.branch = Some("feat-login".to_string());
///         Ok(())
///     }))
///     .build();
///
/// assert_eq!(saga.step_names().collect::<Vec<_>>(), vec!["checkout"]);
/// ```
pub struct SagaBuilder<Ctx: Send, E: Send> {
    name: String,
    steps: Vec<Step<Ctx, E>>,
    store: Option<Arc<dyn SagaLogStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl<Ctx: Send, E: Send> SagaBuilder<Ctx, E> {
    /// Start a saga named `name`. The name keys persisted run logs.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            store: None,
            clock: None,
        }
    }

    /// Append a step.
    #[must_use]
    pub fn add_step(mut self, step: Step<Ctx, E>) -> Self {
        self.steps.push(step);
        self
    }

    /// Persist run logs to `store` instead of an in-memory store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SagaLogStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Take `completed_at` timestamps from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn build(self) -> Saga<Ctx, E>
    where
        E: Debug,
    {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySagaLogStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        Saga::from_parts(self.name, self.steps, store, clock)
    }
}
