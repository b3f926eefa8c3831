//! # dog-tenancy: tenant resolution and per-unit-of-work tenant context
//!
//! Every request or message handled by a multi-tenant DogRS service is
//! attributed to exactly one tenant before any business logic runs:
//!
//! - [`TenantResolver`] turns a raw signal (request host, trusted header,
//!   message field, tenant id) into a validated [`TenantDescriptor`], backed by
//!   a TTL-bounded [`ResolutionCache`] in front of a [`TenantDirectory`].
//! - [`TenantContextScope`] carries that descriptor for one unit of work only,
//!   optionally bound to the running task with [`TenantContextScope::run`].
//! - [`DataHandleFactory`] hands out [`DataHandle`]s bound to the tenant's
//!   connection target from per-tenant pools.
//! - [`Tenancy`] wires the three together; transports call
//!   [`Tenancy::begin`] and [`TenantUnit::finish`].
//!
//! ```rust
//! use std::sync::Arc;
//! use dog_tenancy::prelude::*;
//!
//! struct Dsn;
//!
//! #[async_trait::async_trait]
//! impl Connector for Dsn {
//!     type Connection = String;
//!
//!     async fn connect(&self, tenant: &TenantDescriptor) -> Result<String, HandleError> {
//!         Ok(tenant.connection_target.as_str().to_string())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let directory = InMemoryDirectory::with_tenants([
//!     TenantDescriptor::new("t-acme", "Acme", "acme", "postgres://acme"),
//! ])?;
//! let tenancy = Tenancy::new(Arc::new(directory), Dsn, TenancyConfig::default());
//!
//! let strategy = ResolutionStrategy::ByDomain("acme.app.example.com".into());
//! let mut unit = tenancy.begin(&strategy, &CancellationToken::new()).await?;
//! let (scope, handle) = unit.parts()?;
//! assert_eq!(scope.tenant_id().as_str(), "t-acme");
//! assert_eq!(handle.connection()?, "postgres://acme");
//! unit.finish(true)?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod directory;
pub mod errors;
pub mod handle;
pub mod reaper;
pub mod resolver;
pub mod runtime;
pub mod scope;
pub mod tenant;

#[cfg(feature = "tracing-basic")]
pub mod telemetry;

pub use cache::{CacheKey, CacheLookup, CacheStats, CachedEntry, ResolutionCache};
pub use config::{
    CacheConfig, ConfigSnapshot, ConfigStore, DirectoryConfig, DomainRule, PoolConfig,
    TenancyConfig,
};
pub use directory::{InMemoryDirectory, TenantDirectory};
pub use errors::{
    ConfigError, ContextMisuseError, DirectoryError, ErrorKind, HandleError, ResolutionError,
    UnitError,
};
pub use handle::{Connector, DataHandle, DataHandleFactory, FactoryStats, PoolStats};
pub use reaper::{PoolReaper, ReapReport};
pub use resolver::{tenant_label_from_host, ResolutionStrategy, TenantResolver};
pub use runtime::{Tenancy, TenantUnit};
pub use scope::TenantContextScope;
pub use tenant::{ConnectionTarget, InactiveReason, TenantDescriptor, TenantId};

pub use tokio_util::sync::CancellationToken;

pub mod prelude {
    pub use crate::{
        CancellationToken, Connector, ContextMisuseError, DataHandle, DataHandleFactory,
        HandleError, InMemoryDirectory, ResolutionError, ResolutionStrategy, Tenancy,
        TenancyConfig, TenantContextScope, TenantDescriptor, TenantDirectory, TenantId,
        TenantResolver, TenantUnit, UnitError,
    };
}
