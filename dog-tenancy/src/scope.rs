//! Per-unit-of-work tenant scope.
//!
//! A [`TenantContextScope`] is created for exactly one request or message and
//! torn down when that unit of work ends. It can be passed explicitly, and it
//! can also be bound ambiently with [`TenantContextScope::run`], which uses a
//! tokio task-local: the binding is visible only to the future being run, is
//! not inherited by spawned tasks, and disappears when the future finishes or
//! is dropped. There is no process-wide "current tenant".

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use crate::errors::ContextMisuseError;
use crate::tenant::{ConnectionTarget, TenantDescriptor, TenantId};

tokio::task_local! {
    static CURRENT_SCOPE: TenantContextScope;
}

struct ScopeInner {
    unit_id: Uuid,
    tenant: Arc<TenantDescriptor>,
    cancellation: CancellationToken,
    torn_down: AtomicBool,
    opened_at: Instant,
}

/// The resolved tenant of one unit of work plus that unit's cancellation signal.
///
/// Cloning yields another reference to the same scope (so it can be bound to a
/// task-local); it does not create a new scope.
#[derive(Clone)]
pub struct TenantContextScope {
    inner: Arc<ScopeInner>,
}

impl TenantContextScope {
    /// Scope whose cancellation is a child of the unit of work's token.
    pub fn new(tenant: Arc<TenantDescriptor>, unit_cancellation: &CancellationToken) -> Self {
        Self::build(tenant, unit_cancellation.child_token())
    }

    /// Scope with its own cancellation token, for callers without one.
    pub fn detached(tenant: Arc<TenantDescriptor>) -> Self {
        Self::build(tenant, CancellationToken::new())
    }

    fn build(tenant: Arc<TenantDescriptor>, cancellation: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                unit_id: Uuid::new_v4(),
                tenant,
                cancellation,
                torn_down: AtomicBool::new(false),
                opened_at: Instant::now(),
            }),
        }
    }

    pub fn unit_id(&self) -> Uuid {
        self.inner.unit_id
    }

    /// Always available, including after teardown, so it can be logged.
    pub fn tenant_id(&self) -> &TenantId {
        &self.inner.tenant.id
    }

    /// The resolved tenant. Fails once the scope has been torn down.
    pub fn tenant(&self) -> Result<&TenantDescriptor, ContextMisuseError> {
        self.ensure_live()?;
        Ok(&self.inner.tenant)
    }

    pub fn connection_target(&self) -> Result<&ConnectionTarget, ContextMisuseError> {
        Ok(&self.tenant()?.connection_target)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.inner.opened_at.elapsed()
    }

    /// End the scope: later access fails and the scope's token is cancelled,
    /// stopping any work still bound to it. Succeeds exactly once.
    pub fn tear_down(&self) -> Result<(), ContextMisuseError> {
        if self.inner.torn_down.swap(true, Ordering::AcqRel) {
            let err = ContextMisuseError::ScopeTornDown {
                tenant_id: self.tenant_id().clone(),
            };
            error!(unit_id = %self.unit_id(), tenant = %self.tenant_id(), "{err}");
            return Err(err);
        }
        self.inner.cancellation.cancel();
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), ContextMisuseError> {
        if self.is_torn_down() {
            let err = ContextMisuseError::ScopeTornDown {
                tenant_id: self.tenant_id().clone(),
            };
            error!(unit_id = %self.unit_id(), tenant = %self.tenant_id(), "{err}");
            return Err(err);
        }
        Ok(())
    }

    /// Run `fut` with this scope bound as the task's current scope.
    ///
    /// Refuses to nest: installing a scope while another is active on the same
    /// task is a contract violation.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextMisuseError>
    where
        F: Future,
    {
        if let Ok(active) = CURRENT_SCOPE.try_with(|scope| scope.tenant_id().clone()) {
            let err = ContextMisuseError::NestedScope { active };
            error!(unit_id = %self.unit_id(), tenant = %self.tenant_id(), "{err}");
            return Err(err);
        }
        self.ensure_live()?;
        Ok(CURRENT_SCOPE.scope(self.clone(), fut).await)
    }

    /// The scope bound to the current task.
    pub fn current() -> Result<TenantContextScope, ContextMisuseError> {
        Self::with_current(|scope| scope.clone())
    }

    /// Borrow the scope bound to the current task.
    pub fn with_current<R>(f: impl FnOnce(&TenantContextScope) -> R) -> Result<R, ContextMisuseError> {
        let scope = CURRENT_SCOPE
            .try_with(|scope| scope.clone())
            .map_err(|_| ContextMisuseError::NoActiveScope)?;
        scope.ensure_live()?;
        Ok(f(&scope))
    }

    /// Whether any scope is bound to the current task.
    pub fn is_installed() -> bool {
        CURRENT_SCOPE.try_with(|_| ()).is_ok()
    }
}

impl fmt::Debug for TenantContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantContextScope")
            .field("unit_id", &self.inner.unit_id)
            .field("tenant_id", self.tenant_id())
            .field("torn_down", &self.is_torn_down())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn tenant(id: &str) -> Arc<TenantDescriptor> {
        Arc::new(TenantDescriptor::new(id, id, id, format!("db-{id}")))
    }

    #[tokio::test]
    async fn current_is_only_visible_inside_run() {
        assert!(matches!(
            TenantContextScope::current(),
            Err(ContextMisuseError::NoActiveScope)
        ));

        let scope = TenantContextScope::detached(tenant("a"));
        let seen = scope
            .run(async {
                let current = TenantContextScope::current().unwrap();
                current.tenant().unwrap().connection_target.as_str().to_string()
            })
            .await
            .unwrap();
        assert_eq!(seen, "db-a");
        assert!(!TenantContextScope::is_installed());
    }

    #[tokio::test]
    async fn spawned_tasks_do_not_inherit_the_scope() {
        let scope = TenantContextScope::detached(tenant("a"));
        let inherited = scope
            .run(async { tokio::spawn(async { TenantContextScope::is_installed() }).await.unwrap() })
            .await
            .unwrap();
        assert!(!inherited);
    }

    #[tokio::test]
    #[traced_test]
    async fn nested_install_is_refused_and_logged() {
        let outer = TenantContextScope::detached(tenant("a"));
        let inner = TenantContextScope::detached(tenant("b"));
        let nested = outer.run(async { inner.run(async {}).await }).await.unwrap();
        assert_eq!(
            nested,
            Err(ContextMisuseError::NestedScope {
                active: TenantId::from("a")
            })
        );
        assert!(logs_contain("already installed"));
    }

    #[tokio::test]
    async fn teardown_happens_once_and_cancels() {
        let parent = CancellationToken::new();
        let scope = TenantContextScope::new(tenant("a"), &parent);
        assert!(scope.tenant().is_ok());

        scope.tear_down().unwrap();
        assert!(scope.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(matches!(
            scope.tenant(),
            Err(ContextMisuseError::ScopeTornDown { .. })
        ));
        assert!(scope.tear_down().is_err());
        assert!(scope.run(async {}).await.is_err());
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_scope() {
        let parent = CancellationToken::new();
        let scope = TenantContextScope::new(tenant("a"), &parent);
        parent.cancel();
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn stashed_scope_fails_after_teardown() {
        let scope = TenantContextScope::detached(tenant("a"));
        let stashed = scope
            .run(async { TenantContextScope::current().unwrap() })
            .await
            .unwrap();
        scope.tear_down().unwrap();
        assert!(stashed.connection_target().is_err());
        assert_eq!(stashed.unit_id(), scope.unit_id());
    }
}
