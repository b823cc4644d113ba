//! Typed errors and HTTP mapping.

use crate::tenant::TenantId;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures of the tenant data layer. `Clone` so that one connection attempt can hand the
/// same outcome to every request waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TenantError {
    #[error("tenant not resolved: tenant context middleware did not run for this request")]
    NotResolved,
    #[error("tenant config not found: {0}")]
    ConfigNotFound(TenantId),
    #[error("tenant config invalid for '{tenant}': {reason}")]
    ConfigInvalid { tenant: TenantId, reason: String },
    #[error("connection for tenant '{tenant}' failed: {reason}")]
    Connection { tenant: TenantId, reason: String },
    #[error("model '{model}' could not be defined for tenant '{tenant}': {reason}")]
    ModelDefinition {
        tenant: TenantId,
        model: String,
        reason: String,
    },
    /// Only ever logged; the existing binding is kept.
    #[error("model '{model}' for tenant '{tenant}' requested with a schema that differs from the bound one")]
    ModelBindingConflict { tenant: TenantId, model: String },
    #[error("tenant registry is shut down")]
    RegistryClosed,
}

impl TenantError {
    pub(crate) fn connection(tenant: &TenantId, reason: impl Into<String>) -> Self {
        TenantError::Connection {
            tenant: tenant.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn config_invalid(tenant: &TenantId, reason: impl Into<String>) -> Self {
        TenantError::ConfigInvalid {
            tenant: tenant.clone(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by database drivers and bound model operations.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("query: {0}")]
    Query(String),
    #[error("connection is closed")]
    Closed,
    #[error("model already defined on this connection: {0}")]
    ModelExists(String),
    #[error("unsupported connection uri scheme: {0}")]
    UnsupportedScheme(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid tenant id '{0}' (expected lowercase slug)")]
    InvalidTenantId(String),
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

/// Document validation failure against a model schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct SchemaError {
    pub field: String,
    pub message: String,
}

impl SchemaError {
    pub(crate) fn new(field: &str, message: impl Into<String>) -> Self {
        SchemaError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Failure of an operation on a bound model.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Validation(#[from] SchemaError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Tenant(#[from] TenantError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("validation: {0}")]
    Validation(#[from] SchemaError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<ModelError> for AppError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Validation(e) => AppError::Validation(e),
            ModelError::Driver(e) => AppError::Driver(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Tenant and driver failures carry hostnames and tenant ids; clients only get a generic message.
        let (status, code, message) = match &self {
            AppError::Tenant(TenantError::NotResolved) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "tenant_not_resolved",
                "internal server error".to_string(),
            ),
            AppError::Tenant(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "tenant_unavailable",
                "internal server error".to_string(),
            ),
            AppError::Driver(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "database_error",
                "internal server error".to_string(),
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "internal server error".to_string(),
            ),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error", self.to_string()),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", self.to_string()),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, code, "request failed");
        }
        let details = match &self {
            AppError::Validation(e) => Some(serde_json::json!({ "field": e.field })),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}
