//! Settings validation: tenant ids, rule table and connection limits.

use crate::config::Settings;
use crate::error::ConfigError;
use crate::tenant::TenantId;
use axum::http::HeaderName;
use std::time::Duration;

pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.default_tenant.trim().is_empty() {
        return Err(ConfigError::Missing("DEFAULT_TENANT"));
    }
    TenantId::parse(&settings.default_tenant)?;

    for rule in &settings.rules {
        if rule.pattern.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "empty host pattern for tenant '{}'",
                rule.tenant
            )));
        }
        TenantId::parse(&rule.tenant)?;
    }

    if let Some(header) = &settings.override_header {
        HeaderName::from_bytes(header.as_bytes()).map_err(|_| ConfigError::Invalid {
            key: "TENANT_OVERRIDE_HEADER",
            reason: format!("'{}' is not a valid header name", header),
        })?;
    }
    if settings.bind_addr.trim().is_empty() {
        return Err(ConfigError::Missing("BIND_ADDR"));
    }
    if settings.connect_timeout == Duration::ZERO {
        return Err(ConfigError::Invalid {
            key: "TENANT_CONNECT_TIMEOUT_MS",
            reason: "must be greater than zero".into(),
        });
    }
    if settings.max_connections == 0 {
        return Err(ConfigError::Invalid {
            key: "TENANT_MAX_CONNECTIONS",
            reason: "must be greater than zero".into(),
        });
    }
    if settings.idle_timeout == Some(Duration::ZERO) {
        return Err(ConfigError::Invalid {
            key: "TENANT_IDLE_TIMEOUT_SECS",
            reason: "must be greater than zero (unset it to disable eviction)".into(),
        });
    }
    Ok(())
}
