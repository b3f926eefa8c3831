//! # Errors
//!
//! Tenancy failures are split by who has to react to them:
//!
//! - [`ResolutionError`]: the unit of work cannot be attributed to a usable tenant.
//!   Everything except `DirectoryUnavailable` is terminal.
//! - [`ContextMisuseError`]: a programming-contract violation. Always a defect.
//! - [`DirectoryError`], [`HandleError`], [`ConfigError`]: collaborator failures.
//!
//! Every error maps onto an [`ErrorKind`] carrying the Feathers-style
//! `name` / `code` / `className` triple so transport adapters (HTTP, broker)
//! translate them the same way.

use thiserror::Error;

use crate::tenant::{InactiveReason, TenantId};

/// Feathers-ish error class names + status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,   // 400
    Forbidden,    // 403
    NotFound,     // 404
    Timeout,      // 408
    Conflict,     // 409
    GeneralError, // 500
    Unavailable,  // 503
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout => 408,
            ErrorKind::Conflict => 409,
            ErrorKind::GeneralError => 500,
            ErrorKind::Unavailable => 503,
        }
    }

    /// Feathers error `name` (e.g. "NotFound")
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::GeneralError => "GeneralError",
            ErrorKind::Unavailable => "Unavailable",
        }
    }

    /// Feathers error `className` (kebab-cased)
    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Conflict => "conflict",
            ErrorKind::GeneralError => "general-error",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

/// Outcome of a failed resolution. Decided before any business logic runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("tenant not found: {key}")]
    NotFound { key: String },

    #[error("tenant {tenant_id} is unavailable: {reason}")]
    Inactive {
        tenant_id: TenantId,
        reason: InactiveReason,
    },

    #[error("cannot derive a tenant key from {input:?}: {reason}")]
    AmbiguousKey { input: String, reason: String },

    #[error("tenant directory unavailable: {0}")]
    DirectoryUnavailable(String),
}

impl ResolutionError {
    pub fn ambiguous(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AmbiguousKey {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Only directory outages are worth retrying; every other failure is terminal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DirectoryUnavailable(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Inactive { .. } => ErrorKind::Forbidden,
            Self::AmbiguousKey { .. } => ErrorKind::BadRequest,
            Self::DirectoryUnavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Short, stable label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Inactive { .. } => "inactive",
            Self::AmbiguousKey { .. } => "ambiguous_key",
            Self::DirectoryUnavailable(_) => "directory_unavailable",
        }
    }
}

/// A violation of the scope / handle contract. Treated as a defect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextMisuseError {
    #[error("a tenant scope for {active} is already installed on this task")]
    NestedScope { active: TenantId },

    #[error("no tenant scope is installed on this task")]
    NoActiveScope,

    #[error("tenant scope for {tenant_id} was used after teardown")]
    ScopeTornDown { tenant_id: TenantId },

    #[error("data handle for {tenant_id} was used after it was closed")]
    HandleClosed { tenant_id: TenantId },

    #[error("data handle belongs to {handle_tenant} but scope belongs to {scope_tenant}")]
    TenantMismatch {
        scope_tenant: TenantId,
        handle_tenant: TenantId,
    },
}

impl ContextMisuseError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::GeneralError
    }
}

/// Failures reported by a [`TenantDirectory`](crate::TenantDirectory).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory unreachable: {0}")]
    Unavailable(String),

    #[error("directory call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("identifier {identifier:?} is already registered to {existing}")]
    DuplicateIdentifier {
        identifier: String,
        existing: TenantId,
    },

    #[error("invalid directory seed: {0}")]
    InvalidSeed(String),
}

impl DirectoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::DuplicateIdentifier { .. } => ErrorKind::Conflict,
            Self::InvalidSeed(_) => ErrorKind::BadRequest,
        }
    }
}

impl From<serde_json::Error> for DirectoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidSeed(err.to_string())
    }
}

/// Failures opening a tenant-scoped data handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("refusing to open a handle for unusable tenant {tenant_id}: {reason}")]
    TenantUnusable {
        tenant_id: TenantId,
        reason: InactiveReason,
    },

    #[error("connection to store of tenant {tenant_id} failed: {message}")]
    Connect { tenant_id: TenantId, message: String },

    #[error("no handle available for tenant {tenant_id} within {waited:?}")]
    PoolExhausted {
        tenant_id: TenantId,
        waited: std::time::Duration,
    },

    #[error("handle pool for tenant {0} was closed")]
    PoolClosed(TenantId),
}

impl HandleError {
    pub fn connect(tenant_id: TenantId, message: impl Into<String>) -> Self {
        Self::Connect {
            tenant_id,
            message: message.into(),
        }
    }

    /// Connection and pool pressure are transient; opening for an unusable tenant is not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::TenantUnusable { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TenantUnusable { .. } => ErrorKind::Forbidden,
            Self::Connect { .. } | Self::PoolClosed(_) => ErrorKind::Unavailable,
            Self::PoolExhausted { .. } => ErrorKind::Timeout,
        }
    }
}

/// Anything that stops a unit of work from starting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Misuse(#[from] ContextMisuseError),
}

impl UnitError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Resolution(err) => err.is_transient(),
            Self::Handle(err) => err.is_transient(),
            Self::Misuse(_) => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution(err) => err.kind(),
            Self::Handle(err) => err.kind(),
            Self::Misuse(err) => err.kind(),
        }
    }
}

/// Malformed configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config key {key}: cannot parse {value:?} as {expected}")]
    Invalid {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("config key {key}: {reason}")]
    OutOfRange { key: String, reason: String },
}
