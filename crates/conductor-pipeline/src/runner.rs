use std::fmt::{Debug, Display};
use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::{Clock, EventSink, PipelineEvent, TokioClock, event_types};
use conductor_resilience::{BoxError, DeadLetterQueue, DlqEntry, Redeliver};
use conductor_saga::{Saga, SagaError, SagaLog};
use serde_json::{Value, json};
use tracing::{info, warn};

/// Runs one saga per pipeline request and reports the run as events.
///
/// Every run publishes `pipeline.started` followed by `pipeline.completed` or
/// `pipeline.failed` on the request's stream. When a step fails and a
/// dead-letter queue is attached, the request is queued under
/// `<saga>:<request_id>` for later redelivery.
pub struct PipelineRunner<Ctx: Send, E: Send> {
    saga: Saga<Ctx, E>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    dlq: Option<Arc<DeadLetterQueue>>,
}

impl<Ctx: Send, E: Send> Debug for PipelineRunner<Ctx, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("saga", &self.saga)
            .field("dlq", &self.dlq.is_some())
            .finish_non_exhaustive()
    }
}

impl<Ctx: Send, E: Send + Debug + Display> PipelineRunner<Ctx, E> {
    #[must_use]
    pub fn new(saga: Saga<Ctx, E>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            saga,
            sink,
            clock: Arc::new(TokioClock),
            dlq: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    #[must_use]
    pub fn saga(&self) -> &Saga<Ctx, E> {
        &self.saga
    }

    /// Key the request is dead-lettered under.
    #[must_use]
    pub fn dlq_key(&self, request_id: &str) -> String {
        format!("{}:{request_id}", self.saga.name())
    }

    /// Execute the saga for `request_id`.
    ///
    /// `payload` is what gets dead-lettered if a step fails; it should carry
    /// whatever is needed to rebuild the context for a later retry.
    ///
    /// # Errors
    ///
    /// Returns the saga's error unchanged. A failure to dead-letter the
    /// request is logged and does not replace it.
    pub async fn run(
        &self,
        request_id: &str,
        ctx: &mut Ctx,
        payload: Value,
    ) -> Result<SagaLog, SagaError<E>> {
        self.execute(request_id, ctx, Some(payload)).await
    }

    async fn execute(
        &self,
        request_id: &str,
        ctx: &mut Ctx,
        dead_letter: Option<Value>,
    ) -> Result<SagaLog, SagaError<E>> {
        let saga = self.saga.name();
        let steps: Vec<&str> = self.saga.step_names().collect();
        self.publish(
            event_types::PIPELINE_STARTED,
            request_id,
            json!({ "saga": saga, "steps": steps, "redelivery": dead_letter.is_none() }),
        );

        let (result, log) = self.saga.execute_with_log(request_id, ctx).await;
        match result {
            Ok(()) => {
                info!(saga, request_id, "pipeline completed");
                self.publish(
                    event_types::PIPELINE_COMPLETED,
                    request_id,
                    json!({ "saga": saga, "steps_completed": log.steps_completed }),
                );
                Ok(log)
            }
            Err(error) => {
                let message = describe(&error);
                let dlq_id = match (&error, dead_letter) {
                    (SagaError::StepFailed { step, .. }, Some(payload)) => {
                        self.dead_letter(request_id, step, &message, payload)
                    }
                    _ => None,
                };
                warn!(saga, request_id, error = %message, "pipeline failed");
                self.publish(
                    event_types::PIPELINE_FAILED,
                    request_id,
                    json!({
                        "saga": saga,
                        "failed_at_step": log.failed_at_step,
                        "steps_completed": log.steps_completed,
                        "compensations_run": log.compensations_run,
                        "error": message,
                        "dlq_id": dlq_id,
                    }),
                );
                Err(error)
            }
        }
    }

    fn dead_letter(
        &self,
        request_id: &str,
        step: &str,
        error: &str,
        payload: Value,
    ) -> Option<String> {
        let dlq = self.dlq.as_ref()?;
        let key = self.dlq_key(request_id);
        let entry = json!({
            "saga": self.saga.name(),
            "request_id": request_id,
            "failed_at_step": step,
            "error": error,
            "payload": payload,
        });
        match dlq.enqueue(key.clone(), entry) {
            Ok(Some(_)) => Some(key),
            Ok(None) => None,
            Err(e) => {
                warn!(request_id, key = %key, error = %e, "failed to dead-letter request");
                None
            }
        }
    }

    fn publish(&self, event_type: &str, request_id: &str, data: Value) {
        let event = PipelineEvent::at(event_type, request_id, self.clock.now(), data);
        if let Err(e) = self.sink.publish(event) {
            warn!(request_id, event_type, error = %e, "failed to publish pipeline event");
        }
    }
}

fn describe<E: Debug + Display>(error: &SagaError<E>) -> String {
    match error {
        SagaError::StepFailed { step, source } => format!("step '{step}' failed: {source}"),
        SagaError::Log(e) => format!("{error}: {e}"),
        other => other.to_string(),
    }
}

/// Redelivers dead-lettered requests by running the saga again.
///
/// The context for the retry is rebuilt from the payload that was passed to
/// [`PipelineRunner::run`]. A retry that fails is not dead-lettered again;
/// the queue's own backoff decides what happens next.
pub struct Replay<Ctx: Send, E: Send, F> {
    runner: Arc<PipelineRunner<Ctx, E>>,
    make_context: F,
}

impl<Ctx: Send, E: Send, F> Replay<Ctx, E, F> {
    #[must_use]
    pub fn new(runner: Arc<PipelineRunner<Ctx, E>>, make_context: F) -> Self {
        Self {
            runner,
            make_context,
        }
    }
}

#[async_trait]
impl<Ctx, E, F> Redeliver for Replay<Ctx, E, F>
where
    Ctx: Send + 'static,
    E: Send + Debug + Display + 'static,
    F: Fn(&Value) -> Ctx + Send + Sync + 'static,
{
    async fn redeliver(&self, entry: &DlqEntry) -> Result<(), BoxError> {
        let request_id = entry
            .payload
            .get("request_id")
            .and_then(Value::as_str)
            .ok_or("dead-letter payload has no request_id")?;
        let mut ctx = (self.make_context)(&entry.payload["payload"]);

        self.runner
            .execute(request_id, &mut ctx, None)
            .await
            .map(|_| ())
            .map_err(|e| describe(&e).into())
    }
}
