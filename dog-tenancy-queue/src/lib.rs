//! # dog-tenancy-queue: tenant-aware message consumption
//!
//! Every message is its own unit of work. [`ConsumeInterceptor::consume`]
//! reads the tenant field of the envelope, resolves and validates it through
//! [`dog_tenancy::Tenancy`], and only then opens a tenant-bound data handle,
//! installs a fresh [`dog_tenancy::TenantContextScope`] and calls the
//! [`MessageHandler`]. Unknown, inactive or ambiguous tenants are rejected
//! before anything is opened; directory outages are deferred for redelivery.
//! Teardown runs on every path, including handler panics, timeouts and
//! cancellation.
//!
//! [`ConsumerPool`] runs the interceptor over a stream of deliveries with
//! bounded concurrency and reports each [`ConsumeOutcome`] back so the broker
//! client can ack, reject or requeue ([`Disposition`]).

pub mod envelope;
pub mod error;
pub mod handler;
pub mod interceptor;
pub mod lifecycle;
pub mod metrics;
pub mod worker;

pub use envelope::{Envelope, MessageId, TenantEnvelope};
pub use error::{ConsumerError, HandlerError, HandlerFailure};
pub use handler::MessageHandler;
pub use interceptor::ConsumeInterceptor;
pub use lifecycle::{ConsumeEvent, ConsumeOutcome, ConsumeState, Disposition};
pub use metrics::{ConsumeMetrics, ConsumeMetricsSnapshot};
pub use worker::{ConsumerConfig, ConsumerHandle, ConsumerPool, Delivery};

pub mod prelude {
    pub use crate::{
        ConsumeInterceptor, ConsumeOutcome, ConsumerConfig, ConsumerPool, Disposition, Envelope,
        HandlerError, MessageHandler, TenantEnvelope,
    };
    pub use dog_tenancy::prelude::*;
}
