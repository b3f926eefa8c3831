//! Wiring of resolver, scope and handle factory into one unit-of-work lifecycle.
//!
//! Transport adapters (broker consumers, HTTP middleware) call
//! [`Tenancy::begin`] once per unit of work and [`TenantUnit::finish`] once it
//! ends. A [`TenantUnit`] that is dropped without `finish` (panic, cancelled
//! future) still releases its handle and tears its scope down.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::config::TenancyConfig;
use crate::directory::TenantDirectory;
use crate::errors::{ContextMisuseError, UnitError};
use crate::handle::{Connector, DataHandle, DataHandleFactory};
use crate::reaper::PoolReaper;
use crate::resolver::{ResolutionStrategy, TenantResolver};
use crate::scope::TenantContextScope;
use crate::tenant::TenantId;

/// Shared tenancy services for one process.
pub struct Tenancy<C: Connector> {
    resolver: Arc<TenantResolver>,
    handles: Arc<DataHandleFactory<C>>,
}

impl<C: Connector> Clone for Tenancy<C> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            handles: self.handles.clone(),
        }
    }
}

impl<C: Connector> Tenancy<C> {
    pub fn new(directory: Arc<dyn TenantDirectory>, connector: C, config: TenancyConfig) -> Self {
        let handles = DataHandleFactory::with_config(connector, config.pool.clone());
        Self {
            resolver: Arc::new(TenantResolver::with_config(directory, config)),
            handles: Arc::new(handles),
        }
    }

    pub fn from_parts(resolver: Arc<TenantResolver>, handles: Arc<DataHandleFactory<C>>) -> Self {
        Self { resolver, handles }
    }

    pub fn resolver(&self) -> &Arc<TenantResolver> {
        &self.resolver
    }

    pub fn handles(&self) -> &Arc<DataHandleFactory<C>> {
        &self.handles
    }

    /// Resolve, validate, open a handle and build the scope for one unit of work.
    ///
    /// Nothing is left behind on failure: a handle is only opened for a tenant
    /// that passed validation, and a scope whose handle failed to open is torn
    /// down before returning.
    #[instrument(skip(self, cancellation), fields(strategy = strategy.name()))]
    pub async fn begin(
        &self,
        strategy: &ResolutionStrategy,
        cancellation: &CancellationToken,
    ) -> Result<TenantUnit<C::Connection>, UnitError> {
        let tenant = self.resolver.resolve(strategy).await?;
        let scope = TenantContextScope::new(tenant, cancellation);

        let handle = match self.handles.open(scope.tenant()?).await {
            Ok(handle) => handle,
            Err(err) => {
                scope.tear_down()?;
                return Err(err.into());
            }
        };
        debug!(tenant = %scope.tenant_id(), unit_id = %scope.unit_id(), "unit of work started");
        Ok(TenantUnit::assemble(scope, handle)?)
    }

    /// Provisioning changed a tenant: forget cached resolutions and drop its pool.
    pub fn on_tenant_changed(&self, tenant_id: &TenantId) -> usize {
        let dropped = self.resolver.on_tenant_changed(tenant_id);
        self.handles.evict_tenant(tenant_id);
        dropped
    }

    /// Reaper sweeping both the handle pools and the resolution cache.
    pub fn reaper(&self) -> PoolReaper<C> {
        PoolReaper::new(self.handles.clone()).with_cache(self.resolver.cache().clone())
    }
}

/// The scope and data handle of one in-flight unit of work.
#[derive(Debug)]
pub struct TenantUnit<T: Send + 'static> {
    scope: TenantContextScope,
    handle: Option<DataHandle<T>>,
}

impl<T: Send + 'static> TenantUnit<T> {
    /// Pair a scope with a handle, refusing a handle of another tenant.
    pub fn assemble(
        scope: TenantContextScope,
        handle: DataHandle<T>,
    ) -> Result<Self, ContextMisuseError> {
        if handle.tenant_id() != scope.tenant_id() {
            let err = ContextMisuseError::TenantMismatch {
                scope_tenant: scope.tenant_id().clone(),
                handle_tenant: handle.tenant_id().clone(),
            };
            error!(unit_id = %scope.unit_id(), "{err}");
            handle.discard();
            // fresh scope, first teardown cannot fail
            let _ = scope.tear_down();
            return Err(err);
        }
        Ok(Self {
            scope,
            handle: Some(handle),
        })
    }

    pub fn scope(&self) -> &TenantContextScope {
        &self.scope
    }

    /// Scope and handle together, for handing both to a handler.
    pub fn parts(&mut self) -> Result<(&TenantContextScope, &mut DataHandle<T>), ContextMisuseError> {
        match self.handle.as_mut() {
            Some(handle) => Ok((&self.scope, handle)),
            None => Err(ContextMisuseError::HandleClosed {
                tenant_id: self.scope.tenant_id().clone(),
            }),
        }
    }

    /// Take scope and handle apart. The caller becomes responsible for
    /// closing the handle and tearing the scope down.
    pub fn into_parts(mut self) -> (TenantContextScope, Option<DataHandle<T>>) {
        let handle = self.handle.take();
        (self.scope.clone(), handle)
    }

    /// End the unit of work. The handle goes back to its pool when the unit
    /// succeeded and is discarded otherwise; then the scope is torn down.
    pub fn finish(mut self, succeeded: bool) -> Result<(), ContextMisuseError> {
        self.release(succeeded);
        self.scope.tear_down()
    }

    fn release(&mut self, succeeded: bool) {
        if let Some(handle) = self.handle.take() {
            if succeeded {
                handle.close();
            } else {
                handle.discard();
            }
        }
    }
}

impl<T: Send + 'static> Drop for TenantUnit<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!(unit_id = %self.scope.unit_id(), "unit of work dropped before finish");
            self.release(false);
            if !self.scope.is_torn_down() {
                let _ = self.scope.tear_down();
            }
        }
    }
}
