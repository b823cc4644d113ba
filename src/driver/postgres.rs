//! PostgreSQL driver. Each bound model is a document table:
//! `(id UUID PRIMARY KEY, doc JSONB, created_at, updated_at)`.

use super::{ConnectOptions, DatabaseDriver, Document, DocumentModel, DriverConnection};
use crate::error::DriverError;
use crate::schema::ModelSchema;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions as _, PgPool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct PgDriver;

impl PgDriver {
    pub fn new() -> Self {
        PgDriver
    }
}

#[async_trait]
impl DatabaseDriver for PgDriver {
    fn validate_uri(&self, uri: &str) -> Result<(), String> {
        PgConnectOptions::from_str(uri)
            .map(|_| ())
            .map_err(|e| format!("invalid postgres uri: {}", e))
    }

    async fn open(&self, uri: &str, options: &ConnectOptions) -> Result<Arc<dyn DriverConnection>, DriverError> {
        let connect_opts = PgConnectOptions::from_str(uri).map_err(|e| DriverError::Connect(e.to_string()))?;
        if options.auto_create {
            ensure_database_exists(uri).await?;
        }
        let pool_opts = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.connect_timeout);
        let pool = if options.buffer_commands {
            pool_opts.connect_lazy_with(connect_opts)
        } else {
            // Eager connect: a dead database fails here rather than on the first query.
            pool_opts.connect_with(connect_opts).await?
        };
        Ok(Arc::new(PgTenantConnection {
            pool,
            models: RwLock::new(HashMap::new()),
        }))
    }
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), DriverError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = PgConnectOptions::from_str(&admin_url).map_err(|e| DriverError::Connect(e.to_string()))?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        tracing::info!(database = %db_name, "creating tenant database");
        let created = sqlx::query(&format!("CREATE DATABASE {}", quote_ident(&db_name)))
            .execute(&mut conn)
            .await;
        if let Err(e) = created {
            // Another process may have created it between the check and the CREATE.
            let duplicate = e
                .as_database_error()
                .and_then(|d| d.code())
                .map(|c| c == "42P04")
                .unwrap_or(false);
            if !duplicate {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), DriverError> {
    let after_scheme = url
        .find("://")
        .map(|i| i + 3)
        .ok_or_else(|| DriverError::Connect("database url: no scheme".into()))?;
    let path_start = url[after_scheme..]
        .find('/')
        .map(|i| after_scheme + i + 1)
        .ok_or_else(|| DriverError::Connect("database url: no path".into()))?;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let (db_name, query) = match path_and_query.split_once('?') {
        Some((db, q)) => (db.trim(), Some(q)),
        None => (path_and_query.trim(), None),
    };
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = match query {
        Some(q) => format!("{}postgres?{}", base, q),
        None => format!("{}postgres", base),
    };
    Ok((admin_url, db_name.to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

struct PgTenantConnection {
    pool: PgPool,
    models: RwLock<HashMap<String, Arc<PgModel>>>,
}

#[async_trait]
impl DriverConnection for PgTenantConnection {
    fn model(&self, name: &str) -> Option<Arc<dyn DocumentModel>> {
        let models = self.models.read().ok()?;
        models.get(name).map(|m| m.clone() as Arc<dyn DocumentModel>)
    }

    async fn define_model(&self, name: &str, schema: &ModelSchema) -> Result<Arc<dyn DocumentModel>, DriverError> {
        if self.has_model(name) {
            return Err(DriverError::ModelExists(name.to_string()));
        }
        let collection = schema.collection_name(name);
        let table = quote_ident(&collection);
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                doc JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        for (field, def) in &schema.fields {
            if !(def.index || def.unique) {
                continue;
            }
            let index_name = quote_ident(&format!("{}_{}_idx", collection, field));
            let sql = format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ((doc->>{}))",
                if def.unique { "UNIQUE " } else { "" },
                index_name,
                table,
                quote_literal(field)
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }

        let model = Arc::new(PgModel {
            pool: self.pool.clone(),
            collection,
            table,
        });
        let mut models = self
            .models
            .write()
            .map_err(|_| DriverError::Query("model table lock poisoned".into()))?;
        if models.contains_key(name) {
            return Err(DriverError::ModelExists(name.to_string()));
        }
        models.insert(name.to_string(), model.clone());
        Ok(model)
    }

    async fn ping(&self) -> Result<(), DriverError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PgModel {
    pool: PgPool,
    collection: String,
    /// Quoted table identifier.
    table: String,
}

type DocRow = (Uuid, Value, DateTime<Utc>, DateTime<Utc>);

fn row_to_document((id, doc, created_at, updated_at): DocRow) -> Document {
    let data = match doc {
        Value::Object(m) => m,
        _ => Map::new(),
    };
    Document {
        id,
        data,
        created_at,
        updated_at,
    }
}

const COLUMNS: &str = "id, doc, created_at, updated_at";

#[async_trait]
impl DocumentModel for PgModel {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn insert(&self, data: Map<String, Value>) -> Result<Document, DriverError> {
        let sql = format!("INSERT INTO {} (id, doc) VALUES ($1, $2) RETURNING {}", self.table, COLUMNS);
        tracing::debug!(sql = %sql, "query");
        let row: DocRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(Value::Object(data))
            .fetch_one(&self.pool)
            .await?;
        Ok(row_to_document(row))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Document>, DriverError> {
        let sql = format!("SELECT {} FROM {} WHERE id = $1", COLUMNS, self.table);
        tracing::debug!(sql = %sql, "query");
        let row: Option<DocRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(row_to_document))
    }

    async fn find(&self, filter: &Map<String, Value>, limit: u32, offset: u32) -> Result<Vec<Document>, DriverError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE doc @> $1 ORDER BY created_at, id LIMIT $2 OFFSET $3",
            COLUMNS, self.table
        );
        tracing::debug!(sql = %sql, filter = ?filter, "query");
        let rows: Vec<DocRow> = sqlx::query_as(&sql)
            .bind(Value::Object(filter.clone()))
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_document).collect())
    }

    async fn count(&self, filter: &Map<String, Value>) -> Result<u64, DriverError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE doc @> $1", self.table);
        let (n,): (i64,) = sqlx::query_as(&sql)
            .bind(Value::Object(filter.clone()))
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn update(&self, id: Uuid, patch: Map<String, Value>) -> Result<Option<Document>, DriverError> {
        let sql = format!(
            "UPDATE {} SET doc = doc || $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
            self.table, COLUMNS
        );
        tracing::debug!(sql = %sql, "query");
        let row: Option<DocRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(Value::Object(patch))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_document))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DriverError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        let done = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(done.rows_affected() > 0)
    }
}
