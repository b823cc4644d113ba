//! Tenant identity and per-tenant configuration sources.

use crate::error::{ConfigError, TenantError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

static SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("invalid slug regex"));

/// Opaque tenant key. Sole cache key for connections and bound models.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Unchecked constructor for ids that come from trusted, already validated places.
    pub fn new(id: impl Into<String>) -> Self {
        TenantId(id.into())
    }

    /// Validate a slug (`^[a-z0-9][a-z0-9_-]*$`).
    pub fn parse(id: &str) -> Result<Self, ConfigError> {
        let id = id.trim();
        if SLUG_RE.is_match(id) {
            Ok(TenantId(id.to_string()))
        } else {
            Err(ConfigError::InvalidTenantId(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId::new(s)
    }
}

/// Per-tenant config. Only the connection uri is required by the data layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    #[serde(default, alias = "database_url", alias = "uri")]
    pub connection_uri: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TenantConfig {
    pub fn with_uri(uri: impl Into<String>) -> Self {
        TenantConfig {
            connection_uri: Some(uri.into()),
            ..Default::default()
        }
    }
}

/// "Read config for tenant X". `Ok(None)` means the tenant has no config.
#[async_trait]
pub trait TenantConfigSource: Send + Sync {
    async fn load_tenant_config(&self, tenant: &TenantId) -> Result<Option<TenantConfig>, TenantError>;
}

/// In-memory config source.
#[derive(Clone, Default)]
pub struct StaticConfigSource {
    by_id: HashMap<TenantId, TenantConfig>,
}

impl StaticConfigSource {
    pub fn new() -> Self {
        StaticConfigSource {
            by_id: HashMap::new(),
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<TenantId>, config: TenantConfig) -> Self {
        self.by_id.insert(tenant.into(), config);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl TenantConfigSource for StaticConfigSource {
    async fn load_tenant_config(&self, tenant: &TenantId) -> Result<Option<TenantConfig>, TenantError> {
        Ok(self.by_id.get(tenant).cloned())
    }
}

/// Reads `{root}/{tenant}.json`.
#[derive(Clone, Debug)]
pub struct DirConfigSource {
    root: PathBuf,
}

impl DirConfigSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirConfigSource { root: root.into() }
    }

    fn path_for(&self, tenant: &TenantId) -> Option<PathBuf> {
        let id = tenant.as_str();
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return None;
        }
        Some(self.root.join(format!("{}.json", id)))
    }
}

#[async_trait]
impl TenantConfigSource for DirConfigSource {
    async fn load_tenant_config(&self, tenant: &TenantId) -> Result<Option<TenantConfig>, TenantError> {
        let Some(path) = self.path_for(tenant) else {
            tracing::warn!(tenant = %tenant, "tenant id is not usable as a config file name");
            return Ok(None);
        };
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                tracing::warn!(tenant = %tenant, path = %path.display(), error = %e, "tenant config unreadable");
                return Err(TenantError::ConfigNotFound(tenant.clone()));
            }
        };
        let config: TenantConfig = serde_json::from_str(&raw)
            .map_err(|e| TenantError::config_invalid(tenant, format!("{}: {}", path.display(), e)))?;
        Ok(Some(config))
    }
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment convention: `{PREFIX}{TENANT}_DATABASE_URL` with the tenant upper-cased and
/// non-alphanumerics replaced by `_` (e.g. `TENANT_BRAND_X_DATABASE_URL` for `brand-x`).
#[derive(Clone)]
pub struct EnvConfigSource {
    prefix: String,
    lookup: Lookup,
}

impl EnvConfigSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_lookup(prefix, |key| std::env::var(key).ok())
    }

    pub fn with_lookup<F>(prefix: impl Into<String>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        EnvConfigSource {
            prefix: prefix.into(),
            lookup: Arc::new(lookup),
        }
    }

    pub fn variable_for(&self, tenant: &TenantId) -> String {
        let key: String = tenant
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}{}_DATABASE_URL", self.prefix, key)
    }
}

#[async_trait]
impl TenantConfigSource for EnvConfigSource {
    async fn load_tenant_config(&self, tenant: &TenantId) -> Result<Option<TenantConfig>, TenantError> {
        Ok((self.lookup)(&self.variable_for(tenant)).map(TenantConfig::with_uri))
    }
}

/// Schema holding the central `_sys_tenants` table. From env `TENANCY_SCHEMA`, default `tenancy`.
pub fn tenancy_schema() -> String {
    std::env::var("TENANCY_SCHEMA").unwrap_or_else(|_| "tenancy".into())
}

/// Schema-qualified table name (e.g. "tenancy._sys_tenants").
pub fn qualified_sys_table(table: &str) -> String {
    format!("{}.{}", tenancy_schema(), table)
}

/// Tenant configs kept in a central PostgreSQL database.
#[derive(Clone)]
pub struct PgConfigSource {
    pool: PgPool,
}

impl PgConfigSource {
    pub fn new(pool: PgPool) -> Self {
        PgConfigSource { pool }
    }

    /// Create the schema and `_sys_tenants` if missing.
    pub async fn ensure_tenant_table(&self) -> Result<(), sqlx::Error> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", tenancy_schema()))
            .execute(&self.pool)
            .await?;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                database_url TEXT,
                max_connections INTEGER,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                comment TEXT
            )
            "#,
            qualified_sys_table("_sys_tenants")
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert or replace one tenant row (provisioning).
    pub async fn upsert_tenant(&self, tenant: &TenantId, config: &TenantConfig) -> Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT INTO {} (id, database_url, max_connections, updated_at) VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (id) DO UPDATE SET database_url = EXCLUDED.database_url, \
             max_connections = EXCLUDED.max_connections, updated_at = NOW()",
            qualified_sys_table("_sys_tenants")
        );
        sqlx::query(&sql)
            .bind(tenant.as_str())
            .bind(config.connection_uri.as_deref())
            .bind(config.max_connections.map(|n| n as i32))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TenantConfigSource for PgConfigSource {
    async fn load_tenant_config(&self, tenant: &TenantId) -> Result<Option<TenantConfig>, TenantError> {
        let sql = format!(
            "SELECT database_url, max_connections FROM {} WHERE id = $1",
            qualified_sys_table("_sys_tenants")
        );
        let row = sqlx::query_as::<_, (Option<String>, Option<i32>)>(&sql)
            .bind(tenant.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                tracing::warn!(tenant = %tenant, error = %e, "tenant config lookup failed");
                TenantError::ConfigNotFound(tenant.clone())
            })?;
        Ok(row.map(|(database_url, max_connections)| TenantConfig {
            connection_uri: database_url.filter(|s| !s.is_empty()),
            max_connections: max_connections.and_then(|n| u32::try_from(n).ok()),
            extra: serde_json::Map::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_slugs_only() {
        assert_eq!(TenantId::parse("brandx").unwrap().as_str(), "brandx");
        assert_eq!(TenantId::parse(" brand-x_2 ").unwrap().as_str(), "brand-x_2");
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("Brand").is_err());
        assert!(TenantId::parse("../etc").is_err());
        assert!(TenantId::parse("-lead").is_err());
    }

    #[tokio::test]
    async fn static_source_returns_registered_tenants() {
        let source = StaticConfigSource::new().with_tenant("brandx", TenantConfig::with_uri("memory://brandx"));
        let found = source.load_tenant_config(&"brandx".into()).await.unwrap();
        assert_eq!(found.unwrap().connection_uri.as_deref(), Some("memory://brandx"));
        assert!(source.load_tenant_config(&"other".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dir_source_reads_json_per_tenant() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("brandx.json"),
            r#"{"database_url": "postgres://db/brandx", "max_connections": 3, "brand_color": "red"}"#,
        )
        .unwrap();
        let source = DirConfigSource::new(dir.path());

        let config = source.load_tenant_config(&"brandx".into()).await.unwrap().unwrap();
        assert_eq!(config.connection_uri.as_deref(), Some("postgres://db/brandx"));
        assert_eq!(config.max_connections, Some(3));
        assert_eq!(config.extra.get("brand_color"), Some(&serde_json::json!("red")));

        assert!(source.load_tenant_config(&"missing".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dir_source_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        let source = DirConfigSource::new(dir.path());
        let err = source.load_tenant_config(&"broken".into()).await.unwrap_err();
        assert!(matches!(err, TenantError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn dir_source_never_builds_paths_from_traversal_ids() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirConfigSource::new(dir.path().join("tenants"));
        std::fs::write(dir.path().join("secret.json"), r#"{"uri": "postgres://x/y"}"#).unwrap();
        let found = source.load_tenant_config(&TenantId::new("../secret")).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn env_source_follows_naming_convention() {
        let source = EnvConfigSource::with_lookup("TENANT_", |key| {
            (key == "TENANT_BRAND_X_DATABASE_URL").then(|| "postgres://db/brand_x".to_string())
        });
        assert_eq!(source.variable_for(&"brand-x".into()), "TENANT_BRAND_X_DATABASE_URL");
        let config = source.load_tenant_config(&"brand-x".into()).await.unwrap().unwrap();
        assert_eq!(config.connection_uri.as_deref(), Some("postgres://db/brand_x"));
        assert!(source.load_tenant_config(&"other".into()).await.unwrap().is_none());
    }
}
