pub mod connections;
pub mod models;

pub use connections::{RegistryOptions, TenantConnection, TenantConnectionRegistry};
pub use models::{BoundModel, TenantModelRegistry, MIN_SWEEP_INTERVAL};
