use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::ResolutionCache;
use crate::handle::{Connector, DataHandleFactory};

// tokio's interval rejects a zero period
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Background sweeper for idle tenant pools and expired cache slots.
pub struct PoolReaper<C: Connector> {
    factory: Arc<DataHandleFactory<C>>,
    cache: Option<Arc<ResolutionCache>>,
    interval: Duration,
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub pools_evicted: usize,
    pub cache_entries_purged: usize,
}

impl<C: Connector> PoolReaper<C> {
    /// Runs at the factory's configured `reap_interval`.
    pub fn new(factory: Arc<DataHandleFactory<C>>) -> Self {
        let interval = factory.config().reap_interval.max(MIN_INTERVAL);
        Self {
            factory,
            cache: None,
            interval,
        }
    }

    /// Clamped to at least 1 ms.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Also purge expired slots of this cache on every sweep.
    pub fn with_cache(mut self, cache: Arc<ResolutionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sweep until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        info!("Starting pool reaper with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("pool reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.reap_once();
                    if report.pools_evicted > 0 {
                        info!("Evicted {} idle tenant pools", report.pools_evicted);
                    } else {
                        debug!("No idle tenant pools found");
                    }
                }
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run one sweep (for testing)
    pub fn reap_once(&self) -> ReapReport {
        ReapReport {
            pools_evicted: self.factory.evict_idle(),
            cache_entries_purged: self
                .cache
                .as_ref()
                .map(|cache| cache.purge_expired())
                .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, CachedEntry};
    use crate::config::PoolConfig;
    use crate::handle::tests::FakeConnector;
    use crate::tenant::TenantDescriptor;

    fn config() -> PoolConfig {
        PoolConfig {
            idle_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(10),
            ..PoolConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_pools_and_purges_cache() {
        let factory = Arc::new(DataHandleFactory::with_config(FakeConnector::default(), config()));
        let cache = Arc::new(ResolutionCache::new());
        let tenant = TenantDescriptor::new("t-a", "A", "a", "db-a");
        factory.open(&tenant).await.unwrap().close();
        cache.put(CacheKey::identifier("ghost"), CachedEntry::NotFound, Duration::from_secs(5));

        let reaper = PoolReaper::new(factory.clone()).with_cache(cache.clone());
        assert_eq!(reaper.reap_once(), ReapReport::default());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            reaper.reap_once(),
            ReapReport {
                pools_evicted: 1,
                cache_entries_purged: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_clamped() {
        let factory = Arc::new(DataHandleFactory::with_config(
            FakeConnector::default(),
            PoolConfig {
                reap_interval: Duration::ZERO,
                ..config()
            },
        ));
        let reaper = PoolReaper::new(factory.clone());
        assert_eq!(reaper.interval, MIN_INTERVAL);

        let shutdown = CancellationToken::new();
        let task = reaper.with_interval(Duration::ZERO).spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn background_reaper_stops_on_shutdown() {
        let factory = Arc::new(DataHandleFactory::with_config(FakeConnector::default(), config()));
        factory
            .open(&TenantDescriptor::new("t-a", "A", "a", "db-a"))
            .await
            .unwrap()
            .close();

        let shutdown = CancellationToken::new();
        let task = PoolReaper::new(factory.clone()).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(factory.stats().pools, 0);

        shutdown.cancel();
        task.await.unwrap();
    }
}
