//! Process settings for the tenancy layer.

use crate::driver::ConnectOptions;
use crate::error::ConfigError;
use crate::registry::RegistryOptions;
use crate::resolver::{TenantResolver, TenantRule};
use std::path::PathBuf;
use std::time::Duration;

/// Where per-tenant configs are read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenantConfigLocation {
    /// Central `_sys_tenants` table.
    Database { url: String },
    /// `{dir}/{tenant}.json`.
    Directory(PathBuf),
    /// `{prefix}{TENANT}_DATABASE_URL` variables.
    Env { prefix: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub bind_addr: String,
    pub default_tenant: String,
    /// File rules first, then inline rules.
    pub rules: Vec<TenantRule>,
    pub override_header: Option<String>,
    pub trust_forwarded_host: bool,
    pub config_location: TenantConfigLocation,
    pub connect_timeout: Duration,
    pub max_connections: u32,
    pub auto_create: bool,
    pub idle_timeout: Option<Duration>,
    pub models_path: Option<PathBuf>,
}

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_TENANT: &str = "default";
pub const DEFAULT_ENV_PREFIX: &str = "TENANT_";

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            default_tenant: DEFAULT_TENANT.to_string(),
            rules: Vec::new(),
            override_header: None,
            trust_forwarded_host: false,
            config_location: TenantConfigLocation::Env {
                prefix: DEFAULT_ENV_PREFIX.to_string(),
            },
            connect_timeout: Duration::from_millis(5000),
            max_connections: 5,
            auto_create: true,
            idle_timeout: None,
            models_path: None,
        }
    }
}

impl Settings {
    pub fn resolver(&self) -> Result<TenantResolver, ConfigError> {
        let mut resolver = TenantResolver::new(&self.rules, &self.default_tenant)?
            .with_trust_forwarded_host(self.trust_forwarded_host);
        if let Some(header) = &self.override_header {
            resolver = resolver.with_override_header(header.clone());
        }
        Ok(resolver)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            connect: ConnectOptions {
                buffer_commands: false,
                auto_create: self.auto_create,
                max_connections: self.max_connections,
                connect_timeout: self.connect_timeout,
            },
            open_timeout: self.connect_timeout,
        }
    }

    /// Sweep twice per idle window, at most once a second.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.idle_timeout.map(|idle| (idle / 2).max(Duration::from_secs(1)))
    }
}
