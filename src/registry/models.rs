//! Per-tenant model bindings on top of the connection registry.

use super::connections::{TenantConnection, TenantConnectionRegistry};
use crate::driver::{Document, DocumentModel, DriverConnection, RESERVED_FIELDS};
use crate::error::{DriverError, ModelError, TenantError};
use crate::schema::ModelSchema;
use crate::tenant::TenantId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A model bound to one tenant's connection. Every operation goes to that tenant's database.
pub struct BoundModel {
    tenant_id: TenantId,
    name: String,
    schema: Arc<ModelSchema>,
    handle: Arc<dyn DocumentModel>,
    connection: Weak<TenantConnection>,
}

impl BoundModel {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    pub fn collection(&self) -> &str {
        self.handle.collection()
    }

    /// True while the connection this model was bound on is still the open one.
    pub fn is_live(&self) -> bool {
        self.connection.upgrade().map(|c| c.is_open()).unwrap_or(false)
    }

    pub async fn insert(&self, doc: Map<String, Value>) -> Result<Document, ModelError> {
        let data = self.schema.prepare_insert(strip_reserved(doc))?;
        Ok(self.handle.insert(data).await?)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Document>, ModelError> {
        Ok(self.handle.find_by_id(id).await?)
    }

    pub async fn find(&self, filter: &Map<String, Value>, limit: u32, offset: u32) -> Result<Vec<Document>, ModelError> {
        Ok(self.handle.find(filter, limit, offset).await?)
    }

    pub async fn count(&self, filter: &Map<String, Value>) -> Result<u64, ModelError> {
        Ok(self.handle.count(filter).await?)
    }

    pub async fn update(&self, id: Uuid, patch: Map<String, Value>) -> Result<Option<Document>, ModelError> {
        let patch = self.schema.prepare_update(strip_reserved(patch))?;
        Ok(self.handle.update(id, patch).await?)
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool, ModelError> {
        Ok(self.handle.delete(id).await?)
    }
}

impl std::fmt::Debug for BoundModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundModel")
            .field("tenant_id", &self.tenant_id)
            .field("name", &self.name)
            .field("collection", &self.collection())
            .finish()
    }
}

fn strip_reserved(mut doc: Map<String, Value>) -> Map<String, Value> {
    for key in RESERVED_FIELDS {
        doc.remove(*key);
    }
    doc
}

type ModelKey = (TenantId, String);

pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

pub struct TenantModelRegistry {
    connections: Arc<TenantConnectionRegistry>,
    models: DashMap<ModelKey, Arc<BoundModel>>,
}

impl TenantModelRegistry {
    pub fn new(connections: Arc<TenantConnectionRegistry>) -> Self {
        TenantModelRegistry {
            connections,
            models: DashMap::new(),
        }
    }

    pub fn connections(&self) -> &Arc<TenantConnectionRegistry> {
        &self.connections
    }

    /// Model `name` bound to the tenant's connection. Defined at most once per
    /// (tenant, name); a later call with a different schema gets the existing binding.
    pub async fn get_model(
        &self,
        tenant: &TenantId,
        name: &str,
        schema: Arc<ModelSchema>,
    ) -> Result<Arc<BoundModel>, TenantError> {
        let key = (tenant.clone(), name.to_string());
        if let Some(bound) = self.cached(&key, &schema) {
            return Ok(bound);
        }

        schema.check_patterns().map_err(|e| TenantError::ModelDefinition {
            tenant: tenant.clone(),
            model: name.to_string(),
            reason: e.to_string(),
        })?;
        let conn = self.connections.get_connection(tenant).await?;
        let handle = bind(tenant, name, &schema, conn.handle().as_ref()).await?;
        let fresh = Arc::new(BoundModel {
            tenant_id: tenant.clone(),
            name: name.to_string(),
            schema,
            handle,
            connection: Arc::downgrade(&conn),
        });

        let bound = match self.models.entry(key) {
            Entry::Occupied(mut entry) if !entry.get().is_live() => {
                entry.insert(fresh.clone());
                fresh
            }
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                entry.insert(fresh.clone());
                fresh
            }
        };
        tracing::debug!(tenant = %tenant, model = name, collection = bound.collection(), "model bound");
        Ok(bound)
    }

    fn cached(&self, key: &ModelKey, schema: &Arc<ModelSchema>) -> Option<Arc<BoundModel>> {
        let bound = self.models.get(key).map(|b| b.value().clone())?;
        let Some(conn) = bound.connection.upgrade().filter(|c| c.is_open()) else {
            self.models.remove_if(key, |_, b| !b.is_live());
            return None;
        };
        conn.touch();
        if !Arc::ptr_eq(&bound.schema, schema) && *bound.schema != **schema {
            let conflict = TenantError::ModelBindingConflict {
                tenant: key.0.clone(),
                model: key.1.clone(),
            };
            tracing::warn!(error = %conflict, "keeping existing model binding");
        }
        Some(bound)
    }

    /// Number of cached bindings, live or stale.
    pub fn bound_count(&self) -> usize {
        self.models.len()
    }

    /// Forget the tenant's bindings and drop its connection.
    pub async fn invalidate(&self, tenant: &TenantId) -> bool {
        self.models.retain(|(t, _), _| t != tenant);
        self.connections.invalidate(tenant).await
    }

    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<TenantId> {
        let evicted = self.connections.evict_idle(max_idle).await;
        if !evicted.is_empty() {
            self.models.retain(|(t, _), _| !evicted.contains(t));
        }
        evicted
    }

    pub async fn shutdown(&self) {
        self.models.clear();
        self.connections.shutdown().await;
    }

    /// Periodically close connections idle for `max_idle`. Stops once the registry is dropped
    /// or shut down. `every` is raised to at least [`MIN_SWEEP_INTERVAL`].
    pub fn spawn_idle_sweeper(self: &Arc<Self>, every: Duration, max_idle: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let every = every.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(models) = registry.upgrade() else { break };
                if models.connections.is_closed() {
                    break;
                }
                let evicted = models.evict_idle(max_idle).await;
                if !evicted.is_empty() {
                    tracing::debug!(count = evicted.len(), "idle sweep");
                }
            }
        })
    }
}

/// Reuse a model the connection already knows, or define it.
async fn bind(
    tenant: &TenantId,
    name: &str,
    schema: &ModelSchema,
    conn: &dyn DriverConnection,
) -> Result<Arc<dyn DocumentModel>, TenantError> {
    if let Some(existing) = conn.model(name) {
        return Ok(existing);
    }
    let failed = |reason: String| TenantError::ModelDefinition {
        tenant: tenant.clone(),
        model: name.to_string(),
        reason,
    };
    match conn.define_model(name, schema).await {
        Ok(handle) => Ok(handle),
        // Lost a race with a concurrent definition on the same connection.
        Err(DriverError::ModelExists(_)) => conn
            .model(name)
            .ok_or_else(|| failed("model registered and then vanished".to_string())),
        Err(e) => Err(failed(e.to_string())),
    }
}
