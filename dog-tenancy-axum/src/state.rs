use std::sync::Arc;

use dog_tenancy::{Connector, Tenancy};

use crate::config::HttpTenancyConfig;

/// Router state for [`resolve_tenant`](crate::resolve_tenant).
pub struct TenancyState<C: Connector> {
    pub tenancy: Tenancy<C>,
    pub config: Arc<HttpTenancyConfig>,
}

impl<C: Connector> TenancyState<C> {
    pub fn new(tenancy: Tenancy<C>, config: HttpTenancyConfig) -> Self {
        Self {
            tenancy,
            config: Arc::new(config),
        }
    }
}

impl<C: Connector> Clone for TenancyState<C> {
    fn clone(&self) -> Self {
        Self {
            tenancy: self.tenancy.clone(),
            config: self.config.clone(),
        }
    }
}
