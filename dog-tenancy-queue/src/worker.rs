use std::sync::Arc;

use dog_tenancy::Connector;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::envelope::TenantEnvelope;
use crate::error::ConsumerError;
use crate::handler::MessageHandler;
use crate::interceptor::ConsumeInterceptor;
use crate::lifecycle::ConsumeOutcome;

/// Configuration for the consumer pool
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum number of units of work executing at once
    pub max_in_flight: usize,
    /// Buffered deliveries before `submit` waits
    pub channel_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            channel_capacity: 1024,
        }
    }
}

/// A message handed to the pool plus the channel its outcome is reported on.
pub struct Delivery<E> {
    pub envelope: E,
    reply: oneshot::Sender<ConsumeOutcome>,
}

impl<E> Delivery<E> {
    pub fn new(envelope: E) -> (Self, oneshot::Receiver<ConsumeOutcome>) {
        let (reply, outcome) = oneshot::channel();
        (Self { envelope, reply }, outcome)
    }
}

/// Handle for feeding and stopping a running consumer pool
pub struct ConsumerHandle<E> {
    sender: mpsc::Sender<Delivery<E>>,
    shutdown: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl<E: Send + 'static> ConsumerHandle<E> {
    /// Queue a message; the receiver yields its outcome once torn down.
    pub async fn submit(
        &self,
        envelope: E,
    ) -> Result<oneshot::Receiver<ConsumeOutcome>, ConsumerError> {
        let (delivery, outcome) = Delivery::new(envelope);
        self.sender
            .send(delivery)
            .await
            .map_err(|_| ConsumerError::ShutDown)?;
        Ok(outcome)
    }

    pub fn sender(&self) -> mpsc::Sender<Delivery<E>> {
        self.sender.clone()
    }

    /// Stop taking deliveries and let in-flight units finish.
    pub async fn drain(self) -> Result<(), ConsumerError> {
        drop(self.sender);
        self.join_handle
            .await
            .map_err(|e| ConsumerError::Join(e.to_string()))
    }

    /// Cancel in-flight units (they still tear down) and stop.
    /// Deliveries still buffered are dropped; their receivers see a closed channel.
    pub async fn shutdown(self) -> Result<(), ConsumerError> {
        self.shutdown.cancel();
        drop(self.sender);
        self.join_handle
            .await
            .map_err(|e| ConsumerError::Join(e.to_string()))
    }
}

/// Bounded concurrent consumer running every delivery through a [`ConsumeInterceptor`].
///
/// Handler time limits belong to the interceptor, see
/// [`ConsumeInterceptor::with_handler_timeout`].
pub struct ConsumerPool;

impl ConsumerPool {
    pub fn start<C, E, H>(
        interceptor: Arc<ConsumeInterceptor<C>>,
        handler: Arc<H>,
        config: ConsumerConfig,
    ) -> ConsumerHandle<E>
    where
        C: Connector,
        E: TenantEnvelope + 'static,
        H: MessageHandler<E, C::Connection> + ?Sized,
    {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let shutdown = CancellationToken::new();
        let worker = Worker {
            interceptor,
            handler,
            receiver,
            shutdown: shutdown.clone(),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        };
        let join_handle = tokio::spawn(worker.run());
        ConsumerHandle {
            sender,
            shutdown,
            join_handle,
        }
    }
}

struct Worker<C: Connector, E, H: ?Sized> {
    interceptor: Arc<ConsumeInterceptor<C>>,
    handler: Arc<H>,
    receiver: mpsc::Receiver<Delivery<E>>,
    shutdown: CancellationToken,
    permits: Arc<Semaphore>,
}

impl<C, E, H> Worker<C, E, H>
where
    C: Connector,
    E: TenantEnvelope + 'static,
    H: MessageHandler<E, C::Connection> + ?Sized,
{
    async fn run(mut self) {
        let mut in_flight = JoinSet::new();
        info!("Consumer pool started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Consumer pool shutdown requested");
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Consumer task failed: {}", e);
                    }
                }
                delivery = self.receiver.recv() => {
                    let Some(delivery) = delivery else {
                        debug!("Delivery channel closed, draining");
                        break;
                    };
                    let permit = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        permit = self.permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };

                    let interceptor = self.interceptor.clone();
                    let handler = self.handler.clone();
                    let cancellation = self.shutdown.child_token();
                    in_flight.spawn(async move {
                        let Delivery { envelope, reply } = delivery;
                        let outcome = interceptor
                            .consume(&envelope, handler.as_ref(), &cancellation)
                            .await;
                        // receiver may have gone away; the outcome is already recorded
                        let _ = reply.send(outcome);
                        drop(permit);
                    });
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Consumer task failed: {}", e);
            }
        }
        info!("Consumer pool stopped");
    }
}
