use axum::routing::MethodRouter;
use axum::{middleware::from_fn_with_state, Router};
use dog_tenancy::{Connector, Tenancy};
use tokio::net::{TcpListener, ToSocketAddrs};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::HttpTenancyConfig;
use crate::middleware::resolve_tenant;
use crate::state::TenancyState;

/// Wrap `router` so every request is resolved to a tenant before it is routed.
///
/// Layer order, outermost first: request id is set, request id is propagated
/// to the response, the request is traced, then the tenant is resolved. So
/// tenant rejections still carry `x-request-id` and show up in traces.
pub fn with_tenancy<C: Connector>(router: Router, state: TenancyState<C>) -> Router {
    router
        .layer(from_fn_with_state(state, resolve_tenant::<C>))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Small builder for tenant-aware services.
pub struct TenancyApp<C: Connector> {
    pub state: TenancyState<C>,
    router: Router,
}

impl<C: Connector> TenancyApp<C> {
    pub fn new(tenancy: Tenancy<C>, config: HttpTenancyConfig) -> Self {
        Self {
            state: TenancyState::new(tenancy, config),
            router: Router::new(),
        }
    }

    pub fn route(mut self, path: &str, method_router: MethodRouter) -> Self {
        self.router = self.router.route(path, method_router);
        self
    }

    pub fn nest(mut self, path: &str, router: Router) -> Self {
        self.router = self.router.nest(path, router);
        self
    }

    pub fn tenancy(&self) -> &Tenancy<C> {
        &self.state.tenancy
    }

    pub fn into_router(self) -> Router {
        with_tenancy(self.router, self.state)
    }

    pub async fn listen<A>(self, addr: A) -> std::io::Result<()>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, self.into_router()).await
    }
}
