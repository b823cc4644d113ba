//! Tenancy SDK: multi-tenant data access layer.
//!
//! Resolves the tenant of each request from its host, lazily opens one database connection per
//! tenant, and binds named models to that connection so request handlers only ever see models
//! scoped to their own tenant.

mod case;
pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod logging;
pub mod middleware;
pub mod registry;
pub mod resolver;
pub mod response;
pub mod routes;
pub mod schema;
pub mod state;
pub mod tenant;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{CatalogEntry, ModelCatalog};
pub use config::{build_config_source, load_rules_file, validate_settings, Settings, TenantConfigLocation};
pub use driver::{AnyDriver, ConnectOptions, DatabaseDriver, Document, MemoryDriver, PgDriver};
pub use error::{AppError, ConfigError, DriverError, ModelError, SchemaError, TenantError};
pub use extractors::TenantContext;
pub use logging::init_tracing;
pub use middleware::{tenant_context, TenantLayer};
pub use registry::{BoundModel, RegistryOptions, TenantConnection, TenantConnectionRegistry, TenantModelRegistry};
pub use resolver::{TenantResolver, TenantRule, TENANT_ID_HEADER};
pub use routes::{app_router, common_routes, document_routes};
pub use schema::{FieldDef, FieldKind, ModelSchema, ValidationRule};
pub use state::AppState;
pub use tenant::{
    DirConfigSource, EnvConfigSource, PgConfigSource, StaticConfigSource, TenantConfig, TenantConfigSource, TenantId,
};
