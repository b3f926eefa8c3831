use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use crate::cache::{CacheKey, CacheLookup, CachedEntry, ResolutionCache};
use crate::config::{DomainRule, TenancyConfig};
use crate::directory::TenantDirectory;
use crate::errors::{DirectoryError, ResolutionError};
use crate::tenant::{normalize_identifier, TenantDescriptor, TenantId};

/// Where the raw tenant signal came from. The set is closed on purpose:
/// each source has its own reduction rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Request host, e.g. `acme.app.example.com`.
    ByDomain(String),
    /// Identifier asserted by an already-authenticated trusted caller.
    ByHeader(String),
    /// Tenant field of an asynchronous message envelope.
    ByMessageField(String),
    /// Stable tenant id, for internal callers.
    ById(TenantId),
}

impl ResolutionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ByDomain(_) => "domain",
            Self::ByHeader(_) => "header",
            Self::ByMessageField(_) => "message_field",
            Self::ById(_) => "id",
        }
    }

    fn raw(&self) -> &str {
        match self {
            Self::ByDomain(raw) | Self::ByHeader(raw) | Self::ByMessageField(raw) => raw,
            Self::ById(id) => id.as_str(),
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name(), self.raw())
    }
}

/// Reduce a request host to its tenant label.
///
/// Strips an optional port and trailing dot, case-folds, then takes the
/// leftmost label. IP literals, hosts with fewer than `rule.min_labels`
/// labels, empty labels and reserved labels are all ambiguous.
pub fn tenant_label_from_host(host: &str, rule: &DomainRule) -> Result<String, ResolutionError> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(ResolutionError::ambiguous(host, "empty host"));
    }
    if trimmed.starts_with('[') || trimmed.parse::<IpAddr>().is_ok() {
        return Err(ResolutionError::ambiguous(host, "IP literal carries no tenant"));
    }

    let without_port = match trimmed.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        Some(_) => return Err(ResolutionError::ambiguous(host, "malformed port")),
        None => trimmed,
    };
    let name = without_port.trim_end_matches('.').to_lowercase();
    if name.parse::<IpAddr>().is_ok() {
        return Err(ResolutionError::ambiguous(host, "IP literal carries no tenant"));
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.iter().any(|label| label.is_empty()) {
        return Err(ResolutionError::ambiguous(host, "empty domain label"));
    }
    if labels.len() < rule.min_labels {
        return Err(ResolutionError::ambiguous(
            host,
            format!(
                "{} label(s), at least {} required to carry a tenant",
                labels.len(),
                rule.min_labels
            ),
        ));
    }

    let label = labels[0];
    if rule.reserved_labels.iter().any(|reserved| reserved == label) {
        return Err(ResolutionError::ambiguous(
            host,
            format!("{label:?} is a reserved label"),
        ));
    }
    Ok(label.to_string())
}

/// Resolves inbound tenant signals to usable descriptors.
///
/// Cache first, directory on miss. Every positive result, cached or fresh, is
/// validated before it is returned: a deactivated tenant or one without a
/// connection target is `Inactive`, never patched up.
pub struct TenantResolver {
    directory: Arc<dyn TenantDirectory>,
    cache: Arc<ResolutionCache>,
    config: TenancyConfig,
}

impl TenantResolver {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self::with_config(directory, TenancyConfig::default())
    }

    pub fn with_config(directory: Arc<dyn TenantDirectory>, config: TenancyConfig) -> Self {
        Self {
            directory,
            cache: Arc::new(ResolutionCache::new()),
            config,
        }
    }

    /// Share an existing cache (e.g. one also fed by an invalidation listener).
    pub fn with_cache(mut self, cache: Arc<ResolutionCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }

    /// Reduce a strategy to the cache key it is looked up under.
    pub fn lookup_key(&self, strategy: &ResolutionStrategy) -> Result<CacheKey, ResolutionError> {
        match strategy {
            ResolutionStrategy::ByDomain(host) => {
                tenant_label_from_host(host, &self.config.domain).map(CacheKey::Identifier)
            }
            ResolutionStrategy::ByHeader(raw) | ResolutionStrategy::ByMessageField(raw) => {
                let key = normalize_identifier(raw);
                if key.is_empty() {
                    Err(ResolutionError::ambiguous(raw.as_str(), "blank tenant identifier"))
                } else {
                    Ok(CacheKey::Identifier(key))
                }
            }
            ResolutionStrategy::ById(id) => {
                if id.as_str().trim().is_empty() {
                    Err(ResolutionError::ambiguous(id.as_str(), "blank tenant id"))
                } else {
                    Ok(CacheKey::Id(id.clone()))
                }
            }
        }
    }

    #[instrument(skip(self), fields(strategy = strategy.name()))]
    pub async fn resolve(
        &self,
        strategy: &ResolutionStrategy,
    ) -> Result<Arc<TenantDescriptor>, ResolutionError> {
        let key = self.lookup_key(strategy)?;

        let entry = match self.cache.get(&key) {
            CacheLookup::Hit(entry) => {
                trace!(%key, "resolution cache hit");
                entry
            }
            CacheLookup::Miss => {
                debug!(%key, "resolution cache miss, querying directory");
                self.load(&key).await?
            }
        };

        match entry {
            CachedEntry::Found(tenant) => validate(tenant),
            CachedEntry::NotFound => Err(ResolutionError::NotFound {
                key: key_value(&key),
            }),
        }
    }

    pub async fn resolve_host(&self, host: &str) -> Result<Arc<TenantDescriptor>, ResolutionError> {
        self.resolve(&ResolutionStrategy::ByDomain(host.to_string()))
            .await
    }

    pub async fn resolve_id(&self, id: &TenantId) -> Result<Arc<TenantDescriptor>, ResolutionError> {
        self.resolve(&ResolutionStrategy::ById(id.clone())).await
    }

    async fn load(&self, key: &CacheKey) -> Result<CachedEntry, ResolutionError> {
        let timeout = self.config.directory.timeout;
        let epoch = self.cache.epoch();
        let lookup = async {
            match key {
                CacheKey::Id(id) => self.directory.find_by_id(id).await,
                CacheKey::Identifier(identifier) => {
                    self.directory.find_by_identifier(identifier).await
                }
            }
        };

        let found = match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(found)) => found,
            Ok(Err(err)) => return Err(directory_failure(key, err)),
            Err(_) => return Err(directory_failure(key, DirectoryError::Timeout(timeout))),
        };

        let entry = match found {
            Some(tenant) => CachedEntry::Found(Arc::new(tenant)),
            None => CachedEntry::NotFound,
        };
        let ttl = match entry {
            CachedEntry::Found(_) => self.config.cache.positive_ttl,
            CachedEntry::NotFound => self.config.cache.negative_ttl,
        };
        if !self.cache.put_if_current(key.clone(), entry.clone(), ttl, epoch) {
            debug!(%key, "cache invalidated during directory lookup, result not cached");
        }
        Ok(entry)
    }

    /// Drop one cached key so the next resolution goes to the directory.
    pub fn invalidate(&self, strategy: &ResolutionStrategy) -> Result<bool, ResolutionError> {
        let key = self.lookup_key(strategy)?;
        Ok(self.cache.invalidate(&key))
    }

    /// Provisioning changed a tenant (deactivated, renamed, moved store).
    pub fn on_tenant_changed(&self, tenant_id: &TenantId) -> usize {
        let dropped = self.cache.invalidate_tenant(tenant_id);
        debug!(tenant = %tenant_id, dropped, "invalidated cached tenant");
        dropped
    }

    /// Preload positive entries for every active tenant. Returns how many were cached.
    #[instrument(skip(self))]
    pub async fn warm_up(&self) -> Result<usize, ResolutionError> {
        let timeout = self.config.directory.timeout;
        let epoch = self.cache.epoch();
        let tenants = match tokio::time::timeout(timeout, self.directory.list_active()).await {
            Ok(Ok(tenants)) => tenants,
            Ok(Err(err)) => return Err(ResolutionError::DirectoryUnavailable(err.to_string())),
            Err(_) => {
                return Err(ResolutionError::DirectoryUnavailable(
                    DirectoryError::Timeout(timeout).to_string(),
                ))
            }
        };

        let ttl = self.config.cache.positive_ttl;
        for tenant in &tenants {
            let tenant = Arc::new(tenant.clone());
            self.cache.put_if_current(
                CacheKey::Identifier(tenant.lookup_key()),
                CachedEntry::Found(tenant.clone()),
                ttl,
                epoch,
            );
            self.cache.put_if_current(
                CacheKey::Id(tenant.id.clone()),
                CachedEntry::Found(tenant),
                ttl,
                epoch,
            );
        }
        debug!(tenants = tenants.len(), "resolution cache warmed");
        Ok(tenants.len())
    }
}

fn validate(tenant: Arc<TenantDescriptor>) -> Result<Arc<TenantDescriptor>, ResolutionError> {
    match tenant.unusable_reason() {
        None => Ok(tenant),
        Some(reason) => {
            warn!(tenant = %tenant.id, %reason, "refusing unusable tenant");
            Err(ResolutionError::Inactive {
                tenant_id: tenant.id.clone(),
                reason,
            })
        }
    }
}

fn directory_failure(key: &CacheKey, err: DirectoryError) -> ResolutionError {
    warn!(%key, error = %err, "tenant directory unavailable");
    ResolutionError::DirectoryUnavailable(err.to_string())
}

fn key_value(key: &CacheKey) -> String {
    match key {
        CacheKey::Id(id) => id.to_string(),
        CacheKey::Identifier(identifier) => identifier.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::tenant::InactiveReason;
    use proptest::prelude::*;
    use std::time::Duration;

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::with_tenants([
            TenantDescriptor::new("t-acme", "Acme", "acme", "db-acme"),
            TenantDescriptor::new("t-beta", "Beta", "beta", "db-beta").inactive(),
            TenantDescriptor::new("t-hollow", "Hollow", "hollow", ""),
        ])
        .unwrap()
    }

    fn resolver(directory: &InMemoryDirectory) -> TenantResolver {
        TenantResolver::new(Arc::new(directory.clone()))
    }

    #[test]
    fn leftmost_label_of_multi_level_host() {
        let rule = DomainRule::default();
        assert_eq!(tenant_label_from_host("acme.app.example.com", &rule).unwrap(), "acme");
        assert_eq!(tenant_label_from_host("ACME.example.com:8443", &rule).unwrap(), "acme");
        assert_eq!(tenant_label_from_host("acme.example.com.", &rule).unwrap(), "acme");
    }

    #[test]
    fn hosts_without_a_tenant_label_are_ambiguous() {
        let rule = DomainRule::default();
        for host in [
            "",
            "localhost",
            "example.com",
            "www.example.com",
            "127.0.0.1",
            "127.0.0.1:8080",
            "[::1]:8080",
            "acme..example.com",
            "acme.example.com:http",
        ] {
            assert!(
                matches!(
                    tenant_label_from_host(host, &rule),
                    Err(ResolutionError::AmbiguousKey { .. })
                ),
                "{host} should be ambiguous"
            );
        }
    }

    proptest! {
        #[test]
        fn derived_label_is_always_the_folded_leftmost_label(
            tenant in "[a-z][a-z0-9-]{0,15}",
            parents in proptest::collection::vec("[a-z]{1,8}", 2..4),
            upper in any::<bool>(),
        ) {
            prop_assume!(!DomainRule::default().reserved_labels.contains(&tenant));
            let host = format!("{}.{}", tenant, parents.join("."));
            let host = if upper { host.to_uppercase() } else { host };
            let label = tenant_label_from_host(&host, &DomainRule::default()).unwrap();
            prop_assert_eq!(label, tenant);
        }
    }

    #[tokio::test]
    async fn resolves_active_tenant_through_every_strategy() {
        let directory = directory();
        let resolver = resolver(&directory);

        let by_domain = resolver.resolve_host("acme.app.example.com").await.unwrap();
        let by_header = resolver
            .resolve(&ResolutionStrategy::ByHeader("ACME".into()))
            .await
            .unwrap();
        let by_field = resolver
            .resolve(&ResolutionStrategy::ByMessageField("acme".into()))
            .await
            .unwrap();
        let by_id = resolver.resolve_id(&TenantId::from("t-acme")).await.unwrap();

        for tenant in [&by_domain, &by_header, &by_field, &by_id] {
            assert_eq!(tenant.identifier, "acme");
            assert!(!tenant.connection_target.is_empty());
        }
        assert_eq!(*by_domain, *by_header);
        assert_eq!(*by_header, *by_field);
        assert_eq!(*by_field, *by_id);
    }

    #[tokio::test]
    async fn inactive_and_targetless_tenants_fail_closed() {
        let directory = directory();
        let resolver = resolver(&directory);

        let err = resolver
            .resolve(&ResolutionStrategy::ByHeader("beta".into()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ResolutionError::Inactive {
                tenant_id: TenantId::from("t-beta"),
                reason: InactiveReason::Deactivated,
            }
        );

        let err = resolver
            .resolve(&ResolutionStrategy::ByMessageField("hollow".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::Inactive {
                reason: InactiveReason::MissingConnectionTarget,
                ..
            }
        ));

        // cached copies are validated as well
        assert!(resolver
            .resolve(&ResolutionStrategy::ByHeader("beta".into()))
            .await
            .is_err());
        assert_eq!(directory.lookup_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tenant_is_negatively_cached() {
        let directory = directory();
        let resolver = resolver(&directory);
        let ghost = ResolutionStrategy::ByHeader("ghost".into());

        assert!(matches!(
            resolver.resolve(&ghost).await,
            Err(ResolutionError::NotFound { .. })
        ));
        assert!(matches!(
            resolver.resolve(&ghost).await,
            Err(ResolutionError::NotFound { .. })
        ));
        assert_eq!(directory.lookup_count(), 1);

        tokio::time::advance(resolver.config().cache.negative_ttl + Duration::from_millis(1)).await;
        directory
            .upsert(TenantDescriptor::new("t-ghost", "Ghost", "ghost", "db-ghost"))
            .unwrap();
        assert!(resolver.resolve(&ghost).await.is_ok());
        assert_eq!(directory.lookup_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivation_is_visible_after_ttl_or_invalidate() {
        let directory = directory();
        let resolver = resolver(&directory);
        let acme = ResolutionStrategy::ByDomain("acme.app.example.com".into());
        let ttl = resolver.config().cache.positive_ttl;

        resolver.resolve(&acme).await.unwrap();
        directory.deactivate(&TenantId::from("t-acme"));

        // stale but within the contract
        tokio::time::advance(ttl - Duration::from_secs(1)).await;
        assert!(resolver.resolve(&acme).await.is_ok());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            resolver.resolve(&acme).await,
            Err(ResolutionError::Inactive { .. })
        ));

        directory.activate(&TenantId::from("t-acme"));
        assert!(resolver.resolve(&acme).await.is_err());
        assert!(resolver.invalidate(&acme).unwrap());
        assert!(resolver.resolve(&acme).await.is_ok());
    }

    /// Reads the registry, then takes a while to answer.
    struct SlowReply {
        inner: InMemoryDirectory,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl TenantDirectory for SlowReply {
        async fn find_by_id(&self, id: &TenantId) -> Result<Option<TenantDescriptor>, DirectoryError> {
            let found = self.inner.find_by_id(id).await;
            tokio::time::sleep(self.delay).await;
            found
        }

        async fn find_by_identifier(
            &self,
            identifier: &str,
        ) -> Result<Option<TenantDescriptor>, DirectoryError> {
            let found = self.inner.find_by_identifier(identifier).await;
            tokio::time::sleep(self.delay).await;
            found
        }

        async fn list_active(&self) -> Result<Vec<TenantDescriptor>, DirectoryError> {
            self.inner.list_active().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_during_lookup_is_not_undone() {
        let directory = directory();
        let resolver = Arc::new(TenantResolver::new(Arc::new(SlowReply {
            inner: directory.clone(),
            delay: Duration::from_millis(100),
        })));
        let acme = ResolutionStrategy::ByHeader("acme".into());

        let in_flight = tokio::spawn({
            let resolver = resolver.clone();
            let acme = acme.clone();
            async move { resolver.resolve(&acme).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        directory.deactivate(&TenantId::from("t-acme"));
        resolver.invalidate(&acme).unwrap();
        resolver.on_tenant_changed(&TenantId::from("t-acme"));

        // the lookup read the registry before the change
        assert!(in_flight.await.unwrap().is_ok());
        assert!(resolver.cache().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(
            resolver.resolve(&acme).await,
            Err(ResolutionError::Inactive { .. })
        ));
    }

    #[tokio::test]
    async fn tenant_change_forgets_unknown_identifiers() {
        let directory = directory();
        let resolver = resolver(&directory);
        let renamed = ResolutionStrategy::ByHeader("acme-corp".into());
        assert!(matches!(
            resolver.resolve(&renamed).await,
            Err(ResolutionError::NotFound { .. })
        ));

        directory
            .upsert(TenantDescriptor::new("t-acme", "Acme", "acme-corp", "db-acme"))
            .unwrap();
        resolver.on_tenant_changed(&TenantId::from("t-acme"));

        assert_eq!(resolver.resolve(&renamed).await.unwrap().id, TenantId::from("t-acme"));
    }

    #[tokio::test]
    async fn header_and_field_keys_are_trimmed_and_case_folded() {
        let directory = directory();
        let resolver = resolver(&directory);
        for strategy in [
            ResolutionStrategy::ByHeader(" ACME ".into()),
            ResolutionStrategy::ByMessageField("Acme\n".into()),
        ] {
            assert_eq!(resolver.resolve(&strategy).await.unwrap().id, TenantId::from("t-acme"));
        }
        // one directory round-trip, both spellings share the cache slot
        assert_eq!(directory.lookup_count(), 1);
    }

    #[tokio::test]
    async fn tenant_change_drops_all_cached_aliases() {
        let directory = directory();
        let resolver = resolver(&directory);
        resolver.resolve_host("acme.app.example.com").await.unwrap();
        resolver.resolve_id(&TenantId::from("t-acme")).await.unwrap();

        directory.deactivate(&TenantId::from("t-acme"));
        assert_eq!(resolver.on_tenant_changed(&TenantId::from("t-acme")), 2);
        assert!(resolver.resolve_id(&TenantId::from("t-acme")).await.is_err());
        assert!(resolver.resolve_host("acme.app.example.com").await.is_err());
    }

    #[tokio::test]
    async fn outage_is_distinct_from_not_found_and_not_cached() {
        let directory = directory();
        let resolver = resolver(&directory);
        directory.set_unavailable(true);

        let err = resolver
            .resolve(&ResolutionStrategy::ByHeader("acme".into()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(resolver.cache().is_empty());

        directory.set_unavailable(false);
        assert!(resolver
            .resolve(&ResolutionStrategy::ByHeader("acme".into()))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_directory_times_out_as_unavailable() {
        let directory = directory();
        directory.set_latency(Some(Duration::from_secs(30)));
        let resolver = resolver(&directory);
        let err = resolver
            .resolve(&ResolutionStrategy::ByHeader("acme".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::DirectoryUnavailable(_)));
    }

    #[tokio::test]
    async fn blank_identifiers_are_ambiguous_without_a_lookup() {
        let directory = directory();
        let resolver = resolver(&directory);
        for strategy in [
            ResolutionStrategy::ByHeader("  ".into()),
            ResolutionStrategy::ByMessageField(String::new()),
            ResolutionStrategy::ById(TenantId::from("")),
        ] {
            assert!(matches!(
                resolver.resolve(&strategy).await,
                Err(ResolutionError::AmbiguousKey { .. })
            ));
        }
        assert_eq!(directory.lookup_count(), 0);
    }

    #[tokio::test]
    async fn warm_up_serves_active_tenants_from_cache() {
        let directory = directory();
        let resolver = resolver(&directory);
        assert_eq!(resolver.warm_up().await.unwrap(), 1);
        let before = directory.lookup_count();
        resolver.resolve_host("acme.app.example.com").await.unwrap();
        resolver.resolve_id(&TenantId::from("t-acme")).await.unwrap();
        assert_eq!(directory.lookup_count(), before);
    }
}
