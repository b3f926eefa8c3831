//! dog-tenancy-axum: per-request tenant resolution for Axum.
//!
//! [`resolve_tenant`] resolves every request to exactly one tenant (Host
//! header, or a trusted tenant header), refuses unknown, inactive and
//! ambiguous tenants with Feathers-style error bodies, and hands handlers a
//! [`TenantSession`] carrying the request's scope and data handle.

pub mod app;
pub mod config;
mod error;
pub mod middleware;
pub mod session;
pub mod state;

pub use app::{with_tenancy, TenancyApp};
pub use config::HttpTenancyConfig;
pub use error::TenancyHttpError;
pub use middleware::{resolve_tenant, strategy_for};
pub use session::TenantSession;
pub use state::TenancyState;
