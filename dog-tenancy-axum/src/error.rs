use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use dog_tenancy::{ContextMisuseError, ErrorKind, HandleError, ResolutionError, UnitError};
use serde_json::json;

/// A unit of work that could not start, rendered as a Feathers-style error body.
///
/// Messages are client-safe: the internal error (directory hostnames, tenant
/// ids, connection targets) is logged, never returned.
#[derive(Debug)]
pub struct TenancyHttpError {
    pub error: UnitError,
    pub retry_after: Option<Duration>,
}

impl TenancyHttpError {
    pub fn new(error: impl Into<UnitError>) -> Self {
        Self {
            error: error.into(),
            retry_after: None,
        }
    }

    /// Only applied to transient failures.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        if self.error.is_transient() {
            ErrorKind::Unavailable
        } else {
            self.error.kind()
        }
    }

    fn client_message(&self) -> &'static str {
        match &self.error {
            UnitError::Resolution(ResolutionError::NotFound { .. }) => "Tenant not found",
            UnitError::Resolution(ResolutionError::Inactive { .. }) => "Tenant unavailable",
            UnitError::Resolution(ResolutionError::AmbiguousKey { .. }) => {
                "Cannot determine tenant from request"
            }
            UnitError::Resolution(ResolutionError::DirectoryUnavailable(_)) => {
                "Tenant directory unavailable, retry later"
            }
            UnitError::Handle(err) if err.is_transient() => "Tenant store unavailable, retry later",
            UnitError::Handle(_) => "Tenant unavailable",
            UnitError::Misuse(_) => "Internal error",
        }
    }
}

impl From<UnitError> for TenancyHttpError {
    fn from(error: UnitError) -> Self {
        Self::new(error)
    }
}

impl From<ResolutionError> for TenancyHttpError {
    fn from(error: ResolutionError) -> Self {
        Self::new(error)
    }
}

impl From<HandleError> for TenancyHttpError {
    fn from(error: HandleError) -> Self {
        Self::new(error)
    }
}

impl From<ContextMisuseError> for TenancyHttpError {
    fn from(error: ContextMisuseError) -> Self {
        Self::new(error)
    }
}

impl IntoResponse for TenancyHttpError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status =
            StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "name": kind.name(),
            "message": self.client_message(),
            "code": kind.status_code(),
            "className": kind.class_name(),
        });

        let mut response = (status, Json(body)).into_response();
        if let (true, Some(retry_after)) = (self.error.is_transient(), self.retry_after) {
            // Retry-After is whole seconds
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dog_tenancy::{InactiveReason, TenantId};

    #[test]
    fn statuses_follow_error_kind() {
        let cases = [
            (UnitError::from(ResolutionError::NotFound { key: "ghost".into() }), 404),
            (
                UnitError::from(ResolutionError::Inactive {
                    tenant_id: TenantId::from("t"),
                    reason: InactiveReason::Deactivated,
                }),
                403,
            ),
            (UnitError::from(ResolutionError::ambiguous("localhost", "too few labels")), 400),
            (UnitError::from(ResolutionError::DirectoryUnavailable("down".into())), 503),
            (UnitError::from(ContextMisuseError::NoActiveScope), 500),
        ];
        for (error, code) in cases {
            assert_eq!(TenancyHttpError::new(error).kind().status_code(), code);
        }
    }

    #[test]
    fn exhausted_pool_is_reported_as_unavailable() {
        let err = TenancyHttpError::new(HandleError::PoolExhausted {
            tenant_id: TenantId::from("t"),
            waited: Duration::from_millis(10),
        });
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(err.client_message(), "Tenant store unavailable, retry later");
    }

    #[test]
    fn retry_after_only_on_transient_errors() {
        let transient = TenancyHttpError::new(ResolutionError::DirectoryUnavailable("down".into()))
            .with_retry_after(Duration::from_millis(2500))
            .into_response();
        assert_eq!(transient.headers()[header::RETRY_AFTER], "2");

        let terminal = TenancyHttpError::new(ResolutionError::NotFound { key: "x".into() })
            .with_retry_after(Duration::from_secs(5))
            .into_response();
        assert!(terminal.headers().get(header::RETRY_AFTER).is_none());
    }
}
