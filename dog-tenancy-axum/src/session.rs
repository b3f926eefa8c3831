use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use dog_tenancy::{ContextMisuseError, DataHandle, TenantContextScope, TenantDescriptor};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use crate::error::TenancyHttpError;

struct SessionInner<T: Send + 'static> {
    scope: TenantContextScope,
    handle: Mutex<Option<DataHandle<T>>>,
    finished: AtomicBool,
}

/// Tenant scope and data handle of the current request.
///
/// Inserted into request extensions by [`resolve_tenant`](crate::resolve_tenant)
/// and extracted by handlers:
///
/// ```rust,ignore
/// async fn list_orders(session: TenantSession<PgConnection>) -> Result<Json<Vec<Order>>, AppError> {
///     let mut handle = session.handle().await?;
///     let conn = handle.connection_mut()?;
///     // ...
/// }
/// ```
///
/// Clones share the same scope and handle. The middleware finishes the
/// session once the response is produced; if a clone outlives the request,
/// the handle is discarded and the scope torn down when the last clone drops.
pub struct TenantSession<T: Send + 'static> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Send + 'static> Clone for TenantSession<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> TenantSession<T> {
    pub fn new(scope: TenantContextScope, handle: Option<DataHandle<T>>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                scope,
                handle: Mutex::new(handle),
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn scope(&self) -> &TenantContextScope {
        &self.inner.scope
    }

    pub fn tenant(&self) -> Result<&TenantDescriptor, ContextMisuseError> {
        self.inner.scope.tenant()
    }

    /// Exclusive access to the request's data handle.
    pub async fn handle(&self) -> Result<MappedMutexGuard<'_, DataHandle<T>>, ContextMisuseError> {
        let guard = self.inner.handle.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| {
            ContextMisuseError::HandleClosed {
                tenant_id: self.inner.scope.tenant_id().clone(),
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Release the handle (recycled only when `succeeded`) and tear the scope down.
    ///
    /// A handle still borrowed elsewhere is left to the last clone's drop,
    /// which discards it.
    pub fn finish(&self, succeeded: bool) -> Result<(), ContextMisuseError> {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            return Err(ContextMisuseError::ScopeTornDown {
                tenant_id: self.inner.scope.tenant_id().clone(),
            });
        }
        match self.inner.handle.try_lock() {
            Ok(mut slot) => {
                if let Some(handle) = slot.take() {
                    if succeeded {
                        handle.close();
                    } else {
                        handle.discard();
                    }
                }
            }
            Err(_) => {
                debug!(unit_id = %self.inner.scope.unit_id(), "data handle still borrowed at finish");
            }
        }
        self.inner.scope.tear_down()
    }
}

impl<T: Send + 'static> Drop for SessionInner<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.discard();
        }
        if !self.scope.is_torn_down() {
            let _ = self.scope.tear_down();
        }
    }
}

impl<S, T> FromRequestParts<S> for TenantSession<T>
where
    S: Send + Sync,
    T: Send + 'static,
{
    type Rejection = TenancyHttpError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantSession<T>>()
            .cloned()
            .ok_or_else(|| TenancyHttpError::new(ContextMisuseError::NoActiveScope))
    }
}
