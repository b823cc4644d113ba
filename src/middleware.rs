//! Tenant context middleware: resolve the tenant from the request and attach a
//! [`TenantContext`] before the handler runs. Does no I/O; connections open on first use.

use crate::extractors::TenantContext;
use crate::registry::TenantModelRegistry;
use crate::resolver::TenantResolver;
use crate::tenant::TenantId;
use axum::{
    extract::{Request, State},
    http::{Extensions, HeaderMap},
    middleware::Next,
    response::Response,
    Router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct TenantLayer {
    resolver: Arc<TenantResolver>,
    models: Arc<TenantModelRegistry>,
}

impl TenantLayer {
    pub fn new(resolver: Arc<TenantResolver>, models: Arc<TenantModelRegistry>) -> Self {
        TenantLayer { resolver, models }
    }

    pub fn resolver(&self) -> &TenantResolver {
        &self.resolver
    }

    /// Resolve the tenant from `headers` and store its context in `extensions`.
    /// Usable from any framework that exposes request headers and extensions.
    pub fn attach(&self, headers: &HeaderMap, extensions: &mut Extensions) -> TenantId {
        let tenant = self.resolver.resolve_headers(headers);
        extensions.insert(TenantContext::new(tenant.clone(), self.models.clone()));
        tenant
    }

    /// Wrap `router` so every request carries a tenant context.
    pub fn apply<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(axum::middleware::from_fn_with_state(self, tenant_context))
    }
}

pub async fn tenant_context(State(layer): State<TenantLayer>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    let tenant = layer.attach(&parts.headers, &mut parts.extensions);
    tracing::debug!(tenant = %tenant, path = %parts.uri.path(), "tenant resolved");
    next.run(Request::from_parts(parts, body)).await
}
