//! Per-request tenant context, attached by the tenant middleware.

use crate::error::{AppError, TenantError};
use crate::registry::{BoundModel, TenantModelRegistry};
use crate::schema::ModelSchema;
use crate::tenant::TenantId;
use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, Extensions},
};
use std::sync::Arc;

/// The request's tenant plus access to its models. Handlers reach tenant data only through
/// [`TenantContext::get_model`]; they never see a connection.
#[derive(Clone)]
pub struct TenantContext {
    tenant_id: TenantId,
    models: Arc<TenantModelRegistry>,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId, models: Arc<TenantModelRegistry>) -> Self {
        TenantContext { tenant_id, models }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Model `name` on this request's tenant database.
    pub async fn get_model(&self, name: &str, schema: Arc<ModelSchema>) -> Result<Arc<BoundModel>, TenantError> {
        self.models.get_model(&self.tenant_id, name, schema).await
    }

    /// Open the tenant connection if needed and check it answers.
    pub async fn ping(&self) -> Result<(), TenantError> {
        let conn = self.models.connections().get_connection(&self.tenant_id).await?;
        conn.handle()
            .ping()
            .await
            .map_err(|e| TenantError::connection(&self.tenant_id, e.to_string()))
    }

    /// Context stored by the middleware, or `NotResolved` when it did not run.
    pub fn from_extensions(extensions: &Extensions) -> Result<Self, TenantError> {
        extensions.get::<TenantContext>().cloned().ok_or(TenantError::NotResolved)
    }
}

impl std::fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantContext").field("tenant_id", &self.tenant_id).finish()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(TenantContext::from_extensions(&parts.extensions)?)
    }
}
