use async_trait::async_trait;

/// One side of a saga step: the forward action or its compensation.
///
/// Both receive the request's shared context mutably; steps communicate by
/// writing into it.
#[async_trait]
pub trait StepAction<Ctx: Send, E: Send>: Send + Sync {
    /// Run against the shared context.
    ///
    /// # Errors
    ///
    /// Returns the step's own error type when the action cannot complete.
    async fn run(&self, ctx: &mut Ctx) -> Result<(), E>;
}

/// Adapter turning a synchronous closure into a [`StepAction`].
pub struct FnAction<F>(F);

impl<F> FnAction<F> {
    #[must_use]
    pub fn new(action: F) -> Self {
        Self(action)
    }
}

#[async_trait]
impl<Ctx, E, F> StepAction<Ctx, E> for FnAction<F>
where
    Ctx: Send,
    E: Send,
    F: Fn(&mut Ctx) -> Result<(), E> + Send + Sync,
{
    async fn run(&self, ctx: &mut Ctx) -> Result<(), E> {
        (self.0)(ctx)
    }
}

/// A named saga step with an optional compensation.
///
/// Steps without a compensation are skipped during rollback; read-only steps
/// usually have none.
pub struct Step<Ctx: Send, E: Send> {
    name: String,
    action: Box<dyn StepAction<Ctx, E>>,
    compensation: Option<Box<dyn StepAction<Ctx, E>>>,
}

impl<Ctx: Send, E: Send> Step<Ctx, E> {
    #[must_use]
    pub fn new(name: impl Into<String>, action: impl StepAction<Ctx, E> + 'static) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
            compensation: None,
        }
    }

    /// Create a step whose action is a synchronous closure.
    #[must_use]
    pub fn from_fn<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&mut Ctx) -> Result<(), E> + Send + Sync + 'static,
    {
        Self::new(name, FnAction(action))
    }

    #[must_use]
    pub fn compensate_with(mut self, compensation: impl StepAction<Ctx, E> + 'static) -> Self {
        self.compensation = Some(Box::new(compensation));
        self
    }

    #[must_use]
    pub fn compensate_with_fn<F>(self, compensation: F) -> Self
    where
        F: Fn(&mut Ctx) -> Result<(), E> + Send + Sync + 'static,
    {
        self.compensate_with(FnAction(compensation))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }

    pub(crate) fn action(&self) -> &dyn StepAction<Ctx, E> {
        self.action.as_ref()
    }

    pub(crate) fn compensation(&self) -> Option<&dyn StepAction<Ctx, E>> {
        self.compensation.as_deref()
    }
}

impl<Ctx: Send, E: Send> std::fmt::Debug for Step<Ctx, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("has_compensation", &self.has_compensation())
            .finish_non_exhaustive()
    }
}
