use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dog_tenancy::{
    ContextMisuseError, Connector, ResolutionStrategy, Tenancy, TenantId, UnitError,
};
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::envelope::{MessageId, TenantEnvelope};
use crate::error::{HandlerError, HandlerFailure};
use crate::handler::MessageHandler;
use crate::lifecycle::{ConsumeEvent, ConsumeOutcome, ConsumeState};
use crate::metrics::ConsumeMetrics;

const EVENT_CAPACITY: usize = 1024;

enum Ran {
    Finished(Result<(), HandlerFailure>),
    NotInstalled(ContextMisuseError),
}

/// Wraps a message handler: resolve the envelope's tenant, refuse anything
/// unusable, install a fresh scope, run the handler, tear down.
///
/// Teardown (handle released, scope torn down) has always happened by the
/// time [`consume`](Self::consume) returns, whatever the handler did.
pub struct ConsumeInterceptor<C: Connector> {
    tenancy: Tenancy<C>,
    events: broadcast::Sender<ConsumeEvent>,
    metrics: Arc<ConsumeMetrics>,
    handler_timeout: Option<Duration>,
}

impl<C: Connector> ConsumeInterceptor<C> {
    pub fn new(tenancy: Tenancy<C>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tenancy,
            events,
            metrics: Arc::new(ConsumeMetrics::new()),
            handler_timeout: None,
        }
    }

    /// Abandon handlers running longer than `timeout`; treated like cancellation.
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn tenancy(&self) -> &Tenancy<C> {
        &self.tenancy
    }

    /// Stream of state transitions of every unit consumed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsumeEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &ConsumeMetrics {
        &self.metrics
    }

    /// Consume one message as one unit of work.
    #[instrument(skip_all, fields(message_id = %envelope.message_id()))]
    pub async fn consume<E, H>(
        &self,
        envelope: &E,
        handler: &H,
        cancellation: &CancellationToken,
    ) -> ConsumeOutcome
    where
        E: TenantEnvelope,
        H: MessageHandler<E, C::Connection> + ?Sized,
    {
        let message_id = envelope.message_id();
        self.metrics.record_received();
        self.emit(message_id, ConsumeState::Received, None, None);

        let outcome = self.run_unit(envelope, handler, cancellation).await;

        match &outcome {
            ConsumeOutcome::Completed { tenant_id, .. } => {
                debug!(tenant = %tenant_id, "message handled");
            }
            ConsumeOutcome::HandlerFailed { tenant_id, failure, .. } => {
                warn!(tenant = %tenant_id, %failure, "message handler failed");
            }
            ConsumeOutcome::Rejected(UnitError::Misuse(err)) => {
                error!(%err, "message rejected on context misuse");
            }
            ConsumeOutcome::Rejected(err) => warn!(%err, "message rejected"),
            ConsumeOutcome::Deferred(err) => warn!(%err, "message deferred"),
            ConsumeOutcome::Cancelled => debug!("unit of work cancelled before handler"),
        }

        self.metrics.record_outcome(&outcome);
        let unit_id = match &outcome {
            ConsumeOutcome::Completed { unit_id, .. }
            | ConsumeOutcome::HandlerFailed { unit_id, .. } => Some(*unit_id),
            _ => None,
        };
        self.emit(message_id, outcome.state(), outcome.tenant_id(), unit_id);
        outcome
    }

    async fn run_unit<E, H>(
        &self,
        envelope: &E,
        handler: &H,
        cancellation: &CancellationToken,
    ) -> ConsumeOutcome
    where
        E: TenantEnvelope,
        H: MessageHandler<E, C::Connection> + ?Sized,
    {
        let message_id = envelope.message_id();
        self.emit(message_id, ConsumeState::Resolving, None, None);

        let strategy =
            ResolutionStrategy::ByMessageField(envelope.tenant_field().unwrap_or_default().to_string());
        let mut unit = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return ConsumeOutcome::Cancelled,
            begun = self.tenancy.begin(&strategy, cancellation) => match begun {
                Ok(unit) => unit,
                Err(err) if err.is_transient() => return ConsumeOutcome::Deferred(err),
                Err(err) => return ConsumeOutcome::Rejected(err),
            },
        };

        let scope = unit.scope().clone();
        let tenant_id = scope.tenant_id().clone();
        let unit_id = scope.unit_id();
        self.emit(message_id, ConsumeState::Validated, Some(&tenant_id), Some(unit_id));
        self.emit(message_id, ConsumeState::ContextInstalled, Some(&tenant_id), Some(unit_id));

        let ran = match unit.parts() {
            Err(err) => Ran::Finished(Err(HandlerFailure::Error(err.into()))),
            Ok((unit_scope, handle)) => {
                self.emit(message_id, ConsumeState::Executing, Some(&tenant_id), Some(unit_id));
                let call = AssertUnwindSafe(handler.handle(unit_scope, handle, envelope)).catch_unwind();
                let installed = scope.run(call);
                let bounded = async {
                    match self.handler_timeout {
                        Some(limit) => tokio::time::timeout(limit, installed)
                            .await
                            .map_err(|_| HandlerFailure::TimedOut(limit)),
                        None => Ok(installed.await),
                    }
                };

                tokio::select! {
                    biased;
                    _ = scope.cancellation().cancelled() => Ran::Finished(Err(HandlerFailure::Cancelled)),
                    result = bounded => match result {
                        Err(failure) => Ran::Finished(Err(failure)),
                        Ok(Err(misuse)) => Ran::NotInstalled(misuse),
                        Ok(Ok(Err(panic))) => {
                            let message = panic_message(panic);
                            error!(tenant = %tenant_id, %unit_id, panic = %message, "message handler panicked");
                            Ran::Finished(Err(HandlerFailure::Panicked(message)))
                        }
                        Ok(Ok(Ok(handled))) => Ran::Finished(handled.map_err(HandlerFailure::Error)),
                    },
                }
            }
        };

        let succeeded = matches!(ran, Ran::Finished(Ok(())));
        let teardown = unit.finish(succeeded);
        self.emit(message_id, ConsumeState::TornDown, Some(&tenant_id), Some(unit_id));

        match (ran, teardown) {
            (Ran::NotInstalled(err), _) => ConsumeOutcome::Rejected(UnitError::Misuse(err)),
            (Ran::Finished(Ok(())), Ok(())) => ConsumeOutcome::Completed { tenant_id, unit_id },
            (Ran::Finished(Ok(())), Err(misuse)) => ConsumeOutcome::HandlerFailed {
                tenant_id,
                unit_id,
                failure: HandlerFailure::Error(HandlerError::Misuse(misuse)),
            },
            (Ran::Finished(Err(failure)), _) => ConsumeOutcome::HandlerFailed {
                tenant_id,
                unit_id,
                failure,
            },
        }
    }

    fn emit(
        &self,
        message_id: &MessageId,
        state: ConsumeState,
        tenant_id: Option<&TenantId>,
        unit_id: Option<Uuid>,
    ) {
        // no subscribers is fine
        let _ = self.events.send(ConsumeEvent {
            message_id: message_id.clone(),
            state,
            tenant_id: tenant_id.cloned(),
            unit_id,
            at: Utc::now(),
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
