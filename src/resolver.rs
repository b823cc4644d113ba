//! Host-based tenant resolution.
//!
//! Runs on every request before any I/O, so it is a plain ordered substring match over the
//! host name: no lookups, no allocation beyond normalising the host.

use crate::error::ConfigError;
use crate::tenant::TenantId;
use axum::http::{header, HeaderMap};
use serde::{Deserialize, Serialize};

/// Default header for the internal tooling override. Default: `X-Tenant-ID`.
pub const TENANT_ID_HEADER: &str = "X-Tenant-ID";

const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

/// `pattern` is matched as a substring of the normalised host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRule {
    pub pattern: String,
    pub tenant: String,
}

impl TenantRule {
    pub fn new(pattern: impl Into<String>, tenant: impl Into<String>) -> Self {
        TenantRule {
            pattern: pattern.into(),
            tenant: tenant.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TenantResolver {
    rules: Vec<(String, TenantId)>,
    default_tenant: TenantId,
    override_header: Option<String>,
    trust_forwarded_host: bool,
}

impl TenantResolver {
    /// Build from an ordered rule table. Rules are evaluated top-to-bottom, first match wins.
    pub fn new(rules: &[TenantRule], default_tenant: &str) -> Result<Self, ConfigError> {
        let default_tenant = TenantId::parse(default_tenant)?;
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = rule.pattern.trim().to_lowercase();
            if pattern.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "empty host pattern for tenant '{}'",
                    rule.tenant
                )));
            }
            compiled.push((pattern, TenantId::parse(&rule.tenant)?));
        }
        Ok(TenantResolver {
            rules: compiled,
            default_tenant,
            override_header: None,
            trust_forwarded_host: false,
        })
    }

    /// Honour an explicit tenant header (internal tooling). Disabled by default.
    pub fn with_override_header(mut self, header_name: impl Into<String>) -> Self {
        self.override_header = Some(header_name.into());
        self
    }

    /// Prefer `X-Forwarded-Host` over `Host` (behind a trusted proxy).
    pub fn with_trust_forwarded_host(mut self, trust: bool) -> Self {
        self.trust_forwarded_host = trust;
        self
    }

    pub fn default_tenant(&self) -> &TenantId {
        &self.default_tenant
    }

    /// Total: always returns a tenant, the default one when no rule matches.
    pub fn resolve(&self, host: &str) -> TenantId {
        let host = normalize_host(host);
        if !host.is_empty() {
            for (pattern, tenant) in &self.rules {
                if host.contains(pattern.as_str()) {
                    return tenant.clone();
                }
            }
        }
        self.default_tenant.clone()
    }

    /// Resolve from request headers: override header (when enabled and well formed), then host.
    pub fn resolve_headers(&self, headers: &HeaderMap) -> TenantId {
        if let Some(name) = &self.override_header {
            if let Some(raw) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                match TenantId::parse(raw) {
                    Ok(tenant) => return tenant,
                    Err(_) => tracing::debug!(header = %name, "ignoring malformed tenant override header"),
                }
            }
        }
        let forwarded = if self.trust_forwarded_host {
            headers
                .get(FORWARDED_HOST_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
        } else {
            None
        };
        let host = forwarded
            .or_else(|| headers.get(header::HOST).and_then(|v| v.to_str().ok()))
            .unwrap_or("");
        self.resolve(host)
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        // A bare IPv6 address has more colons and no brackets; leave it alone.
        Some((name, port))
            if port.chars().all(|c| c.is_ascii_digit()) && (name.ends_with(']') || !name.contains(':')) =>
        {
            name
        }
        _ => host,
    };
    without_port.trim_end_matches('.').to_lowercase()
}
