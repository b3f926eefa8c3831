//! Tenant-scoped data-access handles.
//!
//! [`DataHandleFactory`] keeps one [`TenantPool`] per tenant id, created on
//! first use and evicted once idle. A pooled connection is only ever inside
//! one [`DataHandle`] at a time: it leaves the idle list when a handle is
//! opened and goes back (or is dropped) when that handle is released.
//!
//! Release happens exactly once per handle. `close` consumes the handle; if
//! the handle is dropped instead (handler panic, cancelled future) the
//! connection is discarded rather than recycled, since its state is unknown.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::errors::{ContextMisuseError, HandleError};
use crate::tenant::{ConnectionTarget, TenantDescriptor, TenantId};

/// Opens physical connections to a tenant's store.
///
/// The concrete persistence technology lives behind this trait.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Connect to `tenant.connection_target`.
    async fn connect(&self, tenant: &TenantDescriptor) -> Result<Self::Connection, HandleError>;
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    released: AtomicU64,
    connections_created: AtomicU64,
    connections_dropped: AtomicU64,
}

/// Point-in-time counters across all pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactoryStats {
    pub pools: usize,
    pub opened: u64,
    pub released: u64,
    pub connections_created: u64,
    pub connections_dropped: u64,
    pub in_use: usize,
    pub idle: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
}

/// Connections of one tenant.
pub struct TenantPool<T> {
    tenant_id: TenantId,
    target: ConnectionTarget,
    idle: Mutex<Vec<T>>,
    permits: Arc<Semaphore>,
    max_idle: usize,
    in_use: AtomicUsize,
    last_released: Mutex<Instant>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl<T: Send + 'static> TenantPool<T> {
    fn new(tenant: &TenantDescriptor, config: &PoolConfig, counters: Arc<Counters>) -> Self {
        Self {
            tenant_id: tenant.id.clone(),
            target: tenant.connection_target.clone(),
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(config.max_per_tenant.min(Semaphore::MAX_PERMITS))),
            max_idle: config.max_idle_per_tenant,
            in_use: AtomicUsize::new(0),
            last_released: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            counters,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_use: self.in_use.load(Ordering::Acquire),
            idle: self.idle.lock().len(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn idle_for(&self) -> Duration {
        self.last_released.lock().elapsed()
    }

    fn take_idle(&self) -> Option<T> {
        self.idle.lock().pop()
    }

    fn release(&self, conn: T, reusable: bool) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        *self.last_released.lock() = Instant::now();
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        if reusable && !self.is_closed() {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_idle {
                idle.push(conn);
                return;
            }
        }
        self.counters
            .connections_dropped
            .fetch_add(1, Ordering::Relaxed);
        drop(conn);
    }

    /// Refuse new handles and drop idle connections. Checked-out handles
    /// finish normally; their connections are dropped on release.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let drained = std::mem::take(&mut *self.idle.lock());
        self.counters
            .connections_dropped
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
    }
}

/// Exclusive, tenant-bound access to one connection for one unit of work.
pub struct DataHandle<T: Send + 'static> {
    conn: Option<T>,
    pool: Arc<TenantPool<T>>,
    handle_id: Uuid,
    broken: bool,
    // dropped after Drop::drop has returned the connection
    _permit: OwnedSemaphorePermit,
}

impl<T: Send + 'static> DataHandle<T> {
    pub fn handle_id(&self) -> Uuid {
        self.handle_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.pool.tenant_id
    }

    pub fn connection_target(&self) -> &ConnectionTarget {
        &self.pool.target
    }

    pub fn connection(&self) -> Result<&T, ContextMisuseError> {
        self.conn.as_ref().ok_or_else(|| ContextMisuseError::HandleClosed {
            tenant_id: self.pool.tenant_id.clone(),
        })
    }

    pub fn connection_mut(&mut self) -> Result<&mut T, ContextMisuseError> {
        let tenant_id = &self.pool.tenant_id;
        self.conn.as_mut().ok_or_else(|| ContextMisuseError::HandleClosed {
            tenant_id: tenant_id.clone(),
        })
    }

    /// Do not recycle this connection on close.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Return the connection to its pool.
    pub fn close(mut self) {
        let reusable = !self.broken;
        self.release(reusable);
    }

    /// Release without recycling.
    pub fn discard(mut self) {
        self.release(false);
    }

    fn release(&mut self, reusable: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, reusable);
        }
    }
}

impl<T: Send + 'static> Drop for DataHandle<T> {
    fn drop(&mut self) {
        if self.conn.is_some() {
            debug!(
                tenant = %self.pool.tenant_id,
                handle_id = %self.handle_id,
                "data handle dropped without close, discarding connection"
            );
            self.release(false);
        }
    }
}

impl<T: Send + 'static> fmt::Debug for DataHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataHandle")
            .field("handle_id", &self.handle_id)
            .field("tenant_id", &self.pool.tenant_id)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

/// Produces tenant-scoped handles from per-tenant pools.
pub struct DataHandleFactory<C: Connector> {
    connector: Arc<C>,
    pools: DashMap<TenantId, Arc<TenantPool<C::Connection>>>,
    config: PoolConfig,
    counters: Arc<Counters>,
}

impl<C: Connector> DataHandleFactory<C> {
    pub fn new(connector: C) -> Self {
        Self::with_config(connector, PoolConfig::default())
    }

    pub fn with_config(connector: C, config: PoolConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            pools: DashMap::new(),
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Open a handle bound to `tenant.connection_target`.
    #[instrument(skip(self, tenant), fields(tenant = %tenant.id))]
    pub async fn open(
        &self,
        tenant: &TenantDescriptor,
    ) -> Result<DataHandle<C::Connection>, HandleError> {
        if let Some(reason) = tenant.unusable_reason() {
            return Err(HandleError::TenantUnusable {
                tenant_id: tenant.id.clone(),
                reason,
            });
        }

        // a pool can be closed by eviction between lookup and acquire; retry once on a fresh one
        let mut attempts = 0;
        let (pool, permit) = loop {
            attempts += 1;
            let pool = self.pool_for(tenant);
            let acquire = pool.permits.clone().acquire_owned();
            match tokio::time::timeout(self.config.acquire_timeout, acquire).await {
                Ok(Ok(permit)) => break (pool, permit),
                Ok(Err(_)) if attempts < 2 => continue,
                Ok(Err(_)) => return Err(HandleError::PoolClosed(tenant.id.clone())),
                Err(_) => {
                    warn!(waited = ?self.config.acquire_timeout, "tenant handle pool exhausted");
                    return Err(HandleError::PoolExhausted {
                        tenant_id: tenant.id.clone(),
                        waited: self.config.acquire_timeout,
                    });
                }
            }
        };

        let conn = match pool.take_idle() {
            Some(conn) => conn,
            None => {
                let conn = self.connector.connect(tenant).await?;
                self.counters
                    .connections_created
                    .fetch_add(1, Ordering::Relaxed);
                conn
            }
        };

        pool.in_use.fetch_add(1, Ordering::AcqRel);
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        Ok(DataHandle {
            conn: Some(conn),
            pool,
            handle_id: Uuid::new_v4(),
            broken: false,
            _permit: permit,
        })
    }

    /// Return a handle to its pool. Same as [`DataHandle::close`].
    pub fn close(&self, handle: DataHandle<C::Connection>) {
        handle.close();
    }

    fn pool_for(&self, tenant: &TenantDescriptor) -> Arc<TenantPool<C::Connection>> {
        if let Some(pool) = self.pools.get(&tenant.id) {
            if pool.target == tenant.connection_target && !pool.is_closed() {
                return pool.value().clone();
            }
        }

        let mut entry = self.pools.entry(tenant.id.clone()).or_insert_with(|| {
            Arc::new(TenantPool::new(tenant, &self.config, self.counters.clone()))
        });
        if entry.target != tenant.connection_target || entry.is_closed() {
            info!(tenant = %tenant.id, "connection target changed, replacing tenant pool");
            entry.close();
            *entry = Arc::new(TenantPool::new(tenant, &self.config, self.counters.clone()));
        }
        entry.value().clone()
    }

    /// Drop pools with nothing checked out for longer than `idle_timeout`.
    pub fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let before = self.pools.len();
        self.pools.retain(|tenant_id, pool| {
            let evict = pool.stats().in_use == 0 && pool.idle_for() >= idle_timeout;
            if evict {
                debug!(tenant = %tenant_id, "evicting idle tenant pool");
                pool.close();
            }
            !evict
        });
        before.saturating_sub(self.pools.len())
    }

    /// Drop a tenant's pool right away, e.g. after deactivation.
    pub fn evict_tenant(&self, tenant_id: &TenantId) -> bool {
        match self.pools.remove(tenant_id) {
            Some((_, pool)) => {
                pool.close();
                true
            }
            None => false,
        }
    }

    pub fn pool_stats(&self, tenant_id: &TenantId) -> Option<PoolStats> {
        self.pools.get(tenant_id).map(|pool| pool.stats())
    }

    pub fn stats(&self) -> FactoryStats {
        let (in_use, idle) = self.pools.iter().fold((0, 0), |(in_use, idle), pool| {
            let stats = pool.stats();
            (in_use + stats.in_use, idle + stats.idle)
        });
        FactoryStats {
            pools: self.pools.len(),
            opened: self.counters.opened.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            connections_created: self.counters.connections_created.load(Ordering::Relaxed),
            connections_dropped: self.counters.connections_dropped.load(Ordering::Relaxed),
            in_use,
            idle,
        }
    }
}
