use std::time::Duration;

use axum::http::HeaderName;
use dog_tenancy::{ConfigError, ConfigSnapshot};

/// How requests are attributed to tenants.
#[derive(Debug, Clone)]
pub struct HttpTenancyConfig {
    /// Header carrying an explicit tenant identifier.
    pub tenant_header: HeaderName,
    /// Honour `tenant_header`. Only enable behind a gateway that has
    /// authenticated the caller's right to assert a tenant; otherwise the
    /// tenant is always derived from the Host header.
    pub trust_header: bool,
    /// Sent as `Retry-After` on 503 responses.
    pub retry_after: Duration,
}

impl Default for HttpTenancyConfig {
    fn default() -> Self {
        Self {
            tenant_header: HeaderName::from_static("x-tenant-id"),
            trust_header: false,
            retry_after: Duration::from_secs(5),
        }
    }
}

impl HttpTenancyConfig {
    /// Reads `http.tenant_header`, `http.trust_header` and `http.retry_after_ms`.
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(header) = snapshot.get("http.tenant_header") {
            config.tenant_header =
                HeaderName::from_bytes(header.trim().as_bytes()).map_err(|_| ConfigError::Invalid {
                    key: "http.tenant_header".to_string(),
                    value: header.to_string(),
                    expected: "HTTP header name",
                })?;
        }
        if let Some(trust) = snapshot.get_bool("http.trust_header")? {
            config.trust_header = trust;
        }
        if let Some(retry_after) = snapshot.get_millis("http.retry_after_ms")? {
            config.retry_after = retry_after;
        }
        Ok(config)
    }

    pub fn trusting_header(mut self) -> Self {
        self.trust_header = true;
        self
    }
}
