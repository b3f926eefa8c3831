use async_trait::async_trait;
use dog_tenancy::{DataHandle, TenantContextScope};

use crate::envelope::TenantEnvelope;
use crate::error::HandlerError;

/// Business logic run for one message, after its tenant has been resolved.
///
/// The scope is also bound ambiently for the duration of the call, so code
/// deeper in the call graph can reach it through
/// [`TenantContextScope::current`] without threading it through.
#[async_trait]
pub trait MessageHandler<E, T>: Send + Sync + 'static
where
    E: TenantEnvelope,
    T: Send + 'static,
{
    async fn handle(
        &self,
        scope: &TenantContextScope,
        handle: &mut DataHandle<T>,
        envelope: &E,
    ) -> Result<(), HandlerError>;
}
