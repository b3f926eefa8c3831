use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::errors::DirectoryError;
use crate::tenant::{normalize_identifier, TenantDescriptor, TenantId};

/// Read-only view of the authoritative tenant registry.
///
/// Implementations talk to whatever durable store provisioning writes to.
/// `Ok(None)` means "definitely no such tenant"; an `Err` means the registry
/// could not answer and the caller must not conclude anything from it.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<TenantDescriptor>, DirectoryError>;

    /// `identifier` is already normalized (case-folded, trimmed).
    async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<TenantDescriptor>, DirectoryError>;

    /// Every tenant that may currently serve units of work.
    async fn list_active(&self) -> Result<Vec<TenantDescriptor>, DirectoryError>;
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<TenantId, TenantDescriptor>,
    // normalized identifier -> id
    by_identifier: HashMap<String, TenantId>,
}

/// In-memory directory for tests, development and statically configured deployments.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    registry: Arc<RwLock<Registry>>,
    lookups: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
    latency: Arc<RwLock<Option<Duration>>>,
}

#[derive(Deserialize)]
struct DirectorySeed {
    tenants: Vec<TenantDescriptor>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenants<I>(tenants: I) -> Result<Self, DirectoryError>
    where
        I: IntoIterator<Item = TenantDescriptor>,
    {
        let directory = Self::new();
        for tenant in tenants {
            directory.upsert(tenant)?;
        }
        Ok(directory)
    }

    /// Load a static tenant list: `{"tenants": [{"id": .., "identifier": .., ...}]}`.
    pub fn from_json(json: &str) -> Result<Self, DirectoryError> {
        let seed: DirectorySeed = serde_json::from_str(json)?;
        Self::with_tenants(seed.tenants)
    }

    /// Insert or replace a tenant, keeping identifiers globally unique.
    pub fn upsert(&self, tenant: TenantDescriptor) -> Result<(), DirectoryError> {
        let key = tenant.lookup_key();
        if key.is_empty() {
            return Err(DirectoryError::InvalidSeed(format!(
                "tenant {} has an empty identifier",
                tenant.id
            )));
        }

        let mut registry = self.registry.write();
        if let Some(existing) = registry.by_identifier.get(&key) {
            if *existing != tenant.id {
                return Err(DirectoryError::DuplicateIdentifier {
                    identifier: tenant.identifier.clone(),
                    existing: existing.clone(),
                });
            }
        }

        // identifier renamed: drop the old index entry
        if let Some(previous) = registry.by_id.get(&tenant.id) {
            let old_key = previous.lookup_key();
            if old_key != key {
                registry.by_identifier.remove(&old_key);
            }
        }

        registry.by_identifier.insert(key, tenant.id.clone());
        registry.by_id.insert(tenant.id.clone(), tenant);
        Ok(())
    }

    /// Flip `is_active` off. Returns false if the tenant is unknown.
    pub fn deactivate(&self, id: &TenantId) -> bool {
        self.set_active(id, false)
    }

    pub fn activate(&self, id: &TenantId) -> bool {
        self.set_active(id, true)
    }

    fn set_active(&self, id: &TenantId, active: bool) -> bool {
        match self.registry.write().by_id.get_mut(id) {
            Some(tenant) => {
                tenant.is_active = active;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &TenantId) -> Option<TenantDescriptor> {
        let mut registry = self.registry.write();
        let removed = registry.by_id.remove(id)?;
        registry.by_identifier.remove(&removed.lookup_key());
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.registry.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn round_trip(&self) -> Result<(), DirectoryError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::Acquire) {
            return Err(DirectoryError::Unavailable(
                "in-memory directory marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

/// Test helpers for deterministic testing
impl InMemoryDirectory {
    /// Number of lookups that reached the directory.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Simulate a registry outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Simulate a slow registry round-trip.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }
}

#[async_trait]
impl TenantDirectory for InMemoryDirectory {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<TenantDescriptor>, DirectoryError> {
        self.round_trip().await?;
        Ok(self.registry.read().by_id.get(id).cloned())
    }

    async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<TenantDescriptor>, DirectoryError> {
        self.round_trip().await?;
        let registry = self.registry.read();
        Ok(registry
            .by_identifier
            .get(&normalize_identifier(identifier))
            .and_then(|id| registry.by_id.get(id))
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<TenantDescriptor>, DirectoryError> {
        self.round_trip().await?;
        let mut active: Vec<TenantDescriptor> = self
            .registry
            .read()
            .by_id
            .values()
            .filter(|t| t.is_usable())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }
}
