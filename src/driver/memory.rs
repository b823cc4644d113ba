//! In-process driver. Each `memory://<name>` uri is its own database, shared by every
//! connection opened to that uri for the lifetime of the driver.

use super::{matches_filter, ConnectOptions, DatabaseDriver, Document, DocumentModel, DriverConnection};
use crate::error::DriverError;
use crate::schema::ModelSchema;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

type Collection = Arc<RwLock<Vec<Document>>>;

#[derive(Default)]
struct MemoryDatabase {
    collections: DashMap<String, Collection>,
}

#[derive(Clone, Default)]
pub struct MemoryDriver {
    databases: Arc<DashMap<String, Arc<MemoryDatabase>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a database, for use with `auto_create = false`.
    pub fn create_database(&self, name: &str) {
        self.databases.entry(name.to_string()).or_default();
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    fn database_name(uri: &str) -> Result<&str, DriverError> {
        match uri.split_once("://") {
            Some((scheme, name)) if scheme.eq_ignore_ascii_case("memory") && !name.is_empty() => {
                Ok(name.trim_end_matches('/'))
            }
            Some((scheme, _)) => Err(DriverError::UnsupportedScheme(scheme.to_string())),
            None => Err(DriverError::Connect("memory uri must look like memory://<name>".into())),
        }
    }
}

#[async_trait]
impl DatabaseDriver for MemoryDriver {
    fn validate_uri(&self, uri: &str) -> Result<(), String> {
        Self::database_name(uri).map(|_| ()).map_err(|e| e.to_string())
    }

    async fn open(&self, uri: &str, options: &ConnectOptions) -> Result<Arc<dyn DriverConnection>, DriverError> {
        let name = Self::database_name(uri)?;
        let db = if options.auto_create {
            self.databases.entry(name.to_string()).or_default().clone()
        } else {
            self.databases
                .get(name)
                .map(|db| db.value().clone())
                .ok_or_else(|| DriverError::Connect(format!("database '{}' does not exist", name)))?
        };
        Ok(Arc::new(MemoryConnection {
            db,
            models: RwLock::new(HashMap::new()),
            open: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    models: RwLock<HashMap<String, Arc<MemoryModel>>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    fn model(&self, name: &str) -> Option<Arc<dyn DocumentModel>> {
        let models = self.models.read().ok()?;
        models.get(name).map(|m| m.clone() as Arc<dyn DocumentModel>)
    }

    async fn define_model(&self, name: &str, schema: &ModelSchema) -> Result<Arc<dyn DocumentModel>, DriverError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        let collection_name = schema.collection_name(name);
        let mut models = self
            .models
            .write()
            .map_err(|_| DriverError::Query("model table lock poisoned".into()))?;
        if models.contains_key(name) {
            return Err(DriverError::ModelExists(name.to_string()));
        }
        let docs = self.db.collections.entry(collection_name.clone()).or_default().clone();
        let model = Arc::new(MemoryModel {
            collection: collection_name,
            docs,
            open: self.open.clone(),
        });
        models.insert(name.to_string(), model.clone());
        Ok(model)
    }

    async fn ping(&self) -> Result<(), DriverError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DriverError::Closed)
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

struct MemoryModel {
    collection: String,
    docs: Collection,
    open: Arc<AtomicBool>,
}

impl MemoryModel {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DriverError::Closed)
        }
    }

    fn poisoned() -> DriverError {
        DriverError::Query("collection lock poisoned".into())
    }
}

#[async_trait]
impl DocumentModel for MemoryModel {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn insert(&self, data: Map<String, Value>) -> Result<Document, DriverError> {
        self.ensure_open()?;
        let now = Utc::now();
        let doc = Document {
            id: Uuid::new_v4(),
            data,
            created_at: now,
            updated_at: now,
        };
        self.docs.write().map_err(|_| Self::poisoned())?.push(doc.clone());
        Ok(doc)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Document>, DriverError> {
        self.ensure_open()?;
        let docs = self.docs.read().map_err(|_| Self::poisoned())?;
        Ok(docs.iter().find(|d| d.id == id).cloned())
    }

    async fn find(&self, filter: &Map<String, Value>, limit: u32, offset: u32) -> Result<Vec<Document>, DriverError> {
        self.ensure_open()?;
        let docs = self.docs.read().map_err(|_| Self::poisoned())?;
        Ok(docs
            .iter()
            .filter(|d| matches_filter(&d.data, filter))
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count(&self, filter: &Map<String, Value>) -> Result<u64, DriverError> {
        self.ensure_open()?;
        let docs = self.docs.read().map_err(|_| Self::poisoned())?;
        Ok(docs.iter().filter(|d| matches_filter(&d.data, filter)).count() as u64)
    }

    async fn update(&self, id: Uuid, patch: Map<String, Value>) -> Result<Option<Document>, DriverError> {
        self.ensure_open()?;
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        let Some(doc) = docs.iter_mut().find(|d| d.id == id) else {
            return Ok(None);
        };
        doc.data.extend(patch);
        doc.updated_at = Utc::now();
        Ok(Some(doc.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DriverError> {
        self.ensure_open()?;
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        let before = docs.len();
        docs.retain(|d| d.id != id);
        Ok(docs.len() != before)
    }
}
