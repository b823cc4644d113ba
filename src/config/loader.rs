//! Load [`Settings`] from environment variables and build the tenant config source.

use crate::config::types::*;
use crate::config::validate_settings;
use crate::error::ConfigError;
use crate::resolver::{TenantRule, TENANT_ID_HEADER};
use crate::tenant::{DirConfigSource, EnvConfigSource, PgConfigSource, TenantConfigSource};
use sqlx::postgres::PgPoolOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

impl Settings {
    /// Read settings from the process environment, after loading `.env` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup` and validate them.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Settings::default();

        let mut rules = match get("TENANT_RULES_FILE") {
            Some(path) => load_rules_file(Path::new(&path))?,
            None => Vec::new(),
        };
        if let Some(inline) = get("TENANT_RULES") {
            rules.extend(parse_rules(&inline)?);
        }

        let override_header = get("TENANT_OVERRIDE_HEADER").and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(TENANT_ID_HEADER.to_string()),
            "0" | "false" | "no" | "off" => None,
            _ => Some(v),
        });

        let config_location = if let Some(url) = get("TENANT_CONFIG_DATABASE_URL") {
            TenantConfigLocation::Database { url }
        } else if let Some(dir) = get("TENANT_CONFIG_DIR") {
            TenantConfigLocation::Directory(PathBuf::from(dir))
        } else {
            TenantConfigLocation::Env {
                prefix: get("TENANT_CONFIG_ENV_PREFIX").unwrap_or_else(|| DEFAULT_ENV_PREFIX.to_string()),
            }
        };

        let settings = Settings {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            default_tenant: get("DEFAULT_TENANT").unwrap_or(defaults.default_tenant),
            rules,
            override_header,
            trust_forwarded_host: match get("TRUST_FORWARDED_HOST") {
                Some(v) => parse_bool("TRUST_FORWARDED_HOST", &v)?,
                None => defaults.trust_forwarded_host,
            },
            config_location,
            connect_timeout: match get("TENANT_CONNECT_TIMEOUT_MS") {
                Some(v) => Duration::from_millis(parse_u64("TENANT_CONNECT_TIMEOUT_MS", &v)?),
                None => defaults.connect_timeout,
            },
            max_connections: match get("TENANT_MAX_CONNECTIONS") {
                Some(v) => u32::try_from(parse_u64("TENANT_MAX_CONNECTIONS", &v)?).map_err(|_| ConfigError::Invalid {
                    key: "TENANT_MAX_CONNECTIONS",
                    reason: "out of range".into(),
                })?,
                None => defaults.max_connections,
            },
            auto_create: match get("TENANT_AUTO_CREATE") {
                Some(v) => parse_bool("TENANT_AUTO_CREATE", &v)?,
                None => defaults.auto_create,
            },
            idle_timeout: get("TENANT_IDLE_TIMEOUT_SECS")
                .map(|v| parse_u64("TENANT_IDLE_TIMEOUT_SECS", &v).map(Duration::from_secs))
                .transpose()?,
            models_path: get("MODELS_PATH").map(PathBuf::from),
        };
        validate_settings(&settings)?;
        Ok(settings)
    }
}

/// Parse `pattern=tenant` pairs separated by `;` or `,`.
pub fn parse_rules(raw: &str) -> Result<Vec<TenantRule>, ConfigError> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(pattern, tenant)| TenantRule::new(pattern.trim(), tenant.trim()))
                .ok_or_else(|| ConfigError::Invalid {
                    key: "TENANT_RULES",
                    reason: format!("expected pattern=tenant, got '{}'", pair),
                })
        })
        .collect()
}

/// Read an ordered rule table from a JSON file: `[{"pattern": "...", "tenant": "..."}]`.
pub fn load_rules_file(path: &Path) -> Result<Vec<TenantRule>, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))
}

/// Build the tenant config source for `location`. The database variant connects to the central
/// database and creates `_sys_tenants` when missing.
pub async fn build_config_source(location: &TenantConfigLocation) -> Result<Arc<dyn TenantConfigSource>, ConfigError> {
    match location {
        TenantConfigLocation::Database { url } => {
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(url)
                .await
                .map_err(|e| ConfigError::Load(format!("tenant config database: {}", e)))?;
            let source = PgConfigSource::new(pool);
            source
                .ensure_tenant_table()
                .await
                .map_err(|e| ConfigError::Load(format!("tenant config table: {}", e)))?;
            Ok(Arc::new(source))
        }
        TenantConfigLocation::Directory(dir) => {
            if !dir.is_dir() {
                return Err(ConfigError::Invalid {
                    key: "TENANT_CONFIG_DIR",
                    reason: format!("{} is not a directory", dir.display()),
                });
            }
            Ok(Arc::new(DirConfigSource::new(dir.clone())))
        }
        TenantConfigLocation::Env { prefix } => Ok(Arc::new(EnvConfigSource::new(prefix.clone()))),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            reason: format!("expected a boolean, got '{}'", raw),
        }),
    }
}

fn parse_u64(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("expected a non-negative integer, got '{}'", raw),
    })
}
