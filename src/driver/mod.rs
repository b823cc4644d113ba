//! Database driver seam: open a connection from a uri, bind named models on it, run document
//! operations through the bound handles.

pub mod memory;
pub mod postgres;

use crate::error::DriverError;
use crate::schema::ModelSchema;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use memory::MemoryDriver;
pub use postgres::{ensure_database_exists, PgDriver};

/// Options applied when a tenant connection is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    /// When false, operations fail immediately instead of queueing until the connection is up.
    pub buffer_commands: bool,
    /// Create the database when it does not exist yet.
    pub auto_create: bool,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            buffer_commands: false,
            auto_create: true,
            max_connections: 5,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// One stored document. `data` never holds the reserved keys `id`, `created_at`, `updated_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    #[serde(flatten)]
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const RESERVED_FIELDS: &[&str] = &["id", "created_at", "updated_at"];

#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Cheap syntactic check run before any I/O.
    fn validate_uri(&self, uri: &str) -> Result<(), String> {
        match uri.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok(()),
            _ => Err("connection uri must look like scheme://...".to_string()),
        }
    }

    async fn open(&self, uri: &str, options: &ConnectOptions) -> Result<Arc<dyn DriverConnection>, DriverError>;
}

#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Model already registered on this connection under `name`.
    fn model(&self, name: &str) -> Option<Arc<dyn DocumentModel>>;

    fn has_model(&self, name: &str) -> bool {
        self.model(name).is_some()
    }

    /// Register `name` on this connection. A name can be defined once per connection;
    /// a second definition fails with [`DriverError::ModelExists`].
    async fn define_model(&self, name: &str, schema: &ModelSchema) -> Result<Arc<dyn DocumentModel>, DriverError>;

    async fn ping(&self) -> Result<(), DriverError>;

    async fn close(&self);
}

/// Raw document storage for one model on one connection. Filters are exact matches on
/// top-level fields.
#[async_trait]
pub trait DocumentModel: Send + Sync {
    fn collection(&self) -> &str;

    async fn insert(&self, data: Map<String, Value>) -> Result<Document, DriverError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Document>, DriverError>;

    async fn find(&self, filter: &Map<String, Value>, limit: u32, offset: u32) -> Result<Vec<Document>, DriverError>;

    async fn count(&self, filter: &Map<String, Value>) -> Result<u64, DriverError>;

    async fn update(&self, id: Uuid, patch: Map<String, Value>) -> Result<Option<Document>, DriverError>;

    async fn delete(&self, id: Uuid) -> Result<bool, DriverError>;
}

/// Picks the driver from the uri scheme: `postgres`/`postgresql` or `memory`.
#[derive(Clone, Default)]
pub struct AnyDriver {
    pg: PgDriver,
    memory: MemoryDriver,
}

impl AnyDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory(&self) -> &MemoryDriver {
        &self.memory
    }

    fn pick(&self, uri: &str) -> Result<&dyn DatabaseDriver, DriverError> {
        match uri.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase()) {
            Some(s) if s == "postgres" || s == "postgresql" => Ok(&self.pg),
            Some(s) if s == "memory" => Ok(&self.memory),
            Some(s) => Err(DriverError::UnsupportedScheme(s)),
            None => Err(DriverError::UnsupportedScheme(String::new())),
        }
    }
}

#[async_trait]
impl DatabaseDriver for AnyDriver {
    fn validate_uri(&self, uri: &str) -> Result<(), String> {
        self.pick(uri).map_err(|e| e.to_string())?.validate_uri(uri)
    }

    async fn open(&self, uri: &str, options: &ConnectOptions) -> Result<Arc<dyn DriverConnection>, DriverError> {
        self.pick(uri)?.open(uri, options).await
    }
}

/// `scheme://host/db` with credentials and query string removed, for logs.
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return "<invalid uri>".to_string();
    };
    let rest = rest.split('?').next().unwrap_or("");
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let host = authority.rsplit('@').next().unwrap_or("");
    format!("{}://{}{}", scheme, host, path)
}

/// Exact-match filter over top-level fields. Numbers compare by value. A `null` filter
/// matches only a field stored as `null`, as JSONB containment does.
pub(crate) fn matches_filter(data: &Map<String, Value>, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(k, expected)| match (data.get(k), expected) {
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(actual), _) => actual == expected,
        (None, _) => false,
    })
}
