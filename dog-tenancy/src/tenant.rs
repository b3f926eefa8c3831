//! Core multi-tenant types for DogRS tenancy.
//!
//! A [`TenantDescriptor`] is the read-only view this crate has of one tenant.
//! Descriptors are produced by a [`TenantDirectory`](crate::TenantDirectory),
//! cached by the resolver and handed to units of work behind an `Arc`; nothing
//! in this crate ever mutates or persists one.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable tenant identifier. Assigned once by provisioning and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Names a tenant's isolated data store (connection string, store selector key, ...).
///
/// `Debug` is redacted because connection strings routinely embed credentials.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionTarget(String);

impl ConnectionTarget {
    pub fn new<S: Into<String>>(target: S) -> Self {
        Self(target.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whitespace-only targets count as empty.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("ConnectionTarget(<empty>)")
        } else {
            f.write_str("ConnectionTarget(<redacted>)")
        }
    }
}

/// One tenant as known to the tenancy subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDescriptor {
    pub id: TenantId,

    /// Display name, never used for lookup.
    pub name: String,

    /// Externally presented slug / subdomain / opaque key. Unique and case-insensitive.
    pub identifier: String,

    pub connection_target: ConnectionTarget,

    #[serde(default = "default_active")]
    pub is_active: bool,

    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_active() -> bool {
    true
}

impl TenantDescriptor {
    pub fn new(
        id: impl Into<TenantId>,
        name: impl Into<String>,
        identifier: impl Into<String>,
        connection_target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            identifier: identifier.into(),
            connection_target: ConnectionTarget::new(connection_target),
            is_active: true,
            properties: HashMap::new(),
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Case-folded identifier, the form used for every lookup.
    pub fn lookup_key(&self) -> String {
        normalize_identifier(&self.identifier)
    }

    /// Returns why this descriptor may not serve a new unit of work, if anything.
    pub fn unusable_reason(&self) -> Option<InactiveReason> {
        if !self.is_active {
            Some(InactiveReason::Deactivated)
        } else if self.connection_target.is_empty() {
            Some(InactiveReason::MissingConnectionTarget)
        } else {
            None
        }
    }

    pub fn is_usable(&self) -> bool {
        self.unusable_reason().is_none()
    }
}

/// Why a tenant that exists is reported as `Inactive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    Deactivated,
    MissingConnectionTarget,
}

impl fmt::Display for InactiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InactiveReason::Deactivated => f.write_str("tenant is deactivated"),
            InactiveReason::MissingConnectionTarget => {
                f.write_str("active tenant has no connection target")
            }
        }
    }
}

/// Case-fold and trim an identifier into its lookup form.
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim().to_lowercase()
}
