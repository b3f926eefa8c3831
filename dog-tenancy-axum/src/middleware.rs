use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dog_tenancy::{CancellationToken, Connector, ResolutionError, ResolutionStrategy};
use tracing::{debug, error, warn};

use crate::config::HttpTenancyConfig;
use crate::error::TenancyHttpError;
use crate::session::TenantSession;
use crate::state::TenancyState;

/// Pick the resolution strategy for a request.
///
/// The tenant header is only consulted when the config trusts it; otherwise
/// (and when it is absent) the tenant comes from the Host header, falling
/// back to the URI authority for HTTP/2.
pub fn strategy_for(
    config: &HttpTenancyConfig,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<ResolutionStrategy, ResolutionError> {
    if config.trust_header {
        if let Some(value) = headers.get(&config.tenant_header) {
            let value = value.to_str().map_err(|_| {
                ResolutionError::ambiguous(
                    config.tenant_header.as_str(),
                    "header value is not visible ASCII",
                )
            })?;
            return Ok(ResolutionStrategy::ByHeader(value.to_string()));
        }
    }

    if let Some(host) = headers.get(header::HOST) {
        let host = host
            .to_str()
            .map_err(|_| ResolutionError::ambiguous("host", "header value is not visible ASCII"))?;
        return Ok(ResolutionStrategy::ByDomain(host.to_string()));
    }
    match uri.authority() {
        Some(authority) => Ok(ResolutionStrategy::ByDomain(authority.as_str().to_string())),
        None => Err(ResolutionError::ambiguous("", "request carries no host")),
    }
}

/// Resolve the request's tenant, then run the rest of the stack inside its scope.
///
/// Failures are answered here and the handler never runs. On success the
/// [`TenantSession`] is available as an extractor and the scope is installed
/// ambiently for the handler future. Once the response exists the handle is
/// released (recycled unless the response is a 5xx) and the scope torn down.
/// A client disconnect drops this future, which cancels the unit's token.
pub async fn resolve_tenant<C: Connector>(
    State(state): State<TenancyState<C>>,
    mut request: Request,
    next: Next,
) -> Response {
    let strategy = match strategy_for(&state.config, request.headers(), request.uri()) {
        Ok(strategy) => strategy,
        Err(err) => {
            debug!(%err, "request carries no usable tenant signal");
            return TenancyHttpError::new(err).into_response();
        }
    };

    let cancellation = CancellationToken::new();
    let _cancel_on_drop = cancellation.clone().drop_guard();

    let unit = match state.tenancy.begin(&strategy, &cancellation).await {
        Ok(unit) => unit,
        Err(err) => {
            if err.is_transient() {
                warn!(%err, %strategy, "tenant resolution deferred");
            } else {
                debug!(%err, %strategy, "tenant resolution refused");
            }
            return TenancyHttpError::new(err)
                .with_retry_after(state.config.retry_after)
                .into_response();
        }
    };

    let (scope, handle) = unit.into_parts();
    let session = TenantSession::new(scope.clone(), handle);
    request.extensions_mut().insert(session.clone());

    let response = match scope.run(next.run(request)).await {
        Ok(response) => response,
        Err(misuse) => {
            error!(%misuse, "tenant middleware nested inside another tenant scope");
            if let Err(err) = session.finish(false) {
                error!(%err, "tenant session teardown failed");
            }
            return TenancyHttpError::new(misuse).into_response();
        }
    };

    let succeeded = !response.status().is_server_error();
    if let Err(err) = session.finish(succeeded) {
        error!(%err, "tenant session teardown failed");
    }
    response
}
