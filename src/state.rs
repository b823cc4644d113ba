//! Shared application state for the document routes.

use crate::catalog::ModelCatalog;
use std::sync::Arc;

/// Tenant data is never reached through the state; handlers go through
/// [`TenantContext`](crate::extractors::TenantContext).
#[derive(Clone, Default)]
pub struct AppState {
    pub catalog: Arc<ModelCatalog>,
}

impl AppState {
    pub fn new(catalog: ModelCatalog) -> Self {
        AppState {
            catalog: Arc::new(catalog),
        }
    }
}
