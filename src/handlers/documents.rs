//! Document CRUD handlers. The model comes from the catalog by path segment and is bound to the
//! request's tenant through [`TenantContext`].

use crate::catalog::CatalogModel;
use crate::error::AppError;
use crate::extractors::TenantContext;
use crate::response::{success_many, success_one, success_one_ok};
use crate::schema::{FieldKind, ModelSchema};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 500;

fn catalog_model<'a>(state: &'a AppState, path_segment: &str, operation: &str) -> Result<&'a CatalogModel, AppError> {
    let model = state
        .catalog
        .get(path_segment)
        .ok_or_else(|| AppError::NotFound(format!("model '{}'", path_segment)))?;
    if !model.allows(operation) {
        return Err(AppError::BadRequest(format!("{} not allowed", operation)));
    }
    Ok(model)
}

fn parse_id(id: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(id).map_err(|_| AppError::BadRequest("invalid id".into()))
}

fn body_to_map(value: Value) -> Result<Map<String, Value>, AppError> {
    match value {
        Value::Object(m) => Ok(m),
        _ => Err(AppError::BadRequest("body must be a JSON object".into())),
    }
}

/// Query strings are untyped; convert using the field's declared kind.
fn query_value_for_field(schema: &ModelSchema, field: &str, raw: &str) -> Value {
    let kind = schema.fields.get(field).map(|f| f.kind).unwrap_or(FieldKind::Any);
    match kind {
        FieldKind::Integer => raw.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::from(raw)),
        FieldKind::Number => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(raw)),
        FieldKind::Boolean if raw.eq_ignore_ascii_case("true") => Value::Bool(true),
        FieldKind::Boolean if raw.eq_ignore_ascii_case("false") => Value::Bool(false),
        _ => Value::from(raw),
    }
}

pub async fn list(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(path_segment): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, AppError> {
    let entry = catalog_model(&state, &path_segment, "read")?;

    let mut limit = DEFAULT_LIMIT;
    let mut offset = 0u32;
    let mut filter = Map::new();
    for (k, v) in params {
        match k.as_str() {
            "limit" => {
                limit = v
                    .parse()
                    .map_err(|_| AppError::BadRequest("limit must be a non-negative integer".into()))?
            }
            "offset" => {
                offset = v
                    .parse()
                    .map_err(|_| AppError::BadRequest("offset must be a non-negative integer".into()))?
            }
            _ if entry.schema.is_filterable(&k) => {
                let value = query_value_for_field(&entry.schema, &k, &v);
                filter.insert(k, value);
            }
            _ => {}
        }
    }
    let limit = limit.min(MAX_LIMIT);

    let model = ctx.get_model(&entry.name, entry.schema.clone()).await?;
    let docs = model.find(&filter, limit, offset).await?;
    let total = model.count(&filter).await?;
    Ok(success_many(docs, total, limit, offset))
}

pub async fn create(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(path_segment): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let entry = catalog_model(&state, &path_segment, "create")?;
    let body = body_to_map(body)?;
    let model = ctx.get_model(&entry.name, entry.schema.clone()).await?;
    let doc = model.insert(body).await?;
    tracing::debug!(tenant = %ctx.tenant_id(), model = %entry.name, id = %doc.id, "document created");
    Ok(success_one(doc))
}

pub async fn read(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path((path_segment, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let entry = catalog_model(&state, &path_segment, "read")?;
    let doc_id = parse_id(&id)?;
    let model = ctx.get_model(&entry.name, entry.schema.clone()).await?;
    let doc = model.find_by_id(doc_id).await?.ok_or_else(|| AppError::NotFound(id))?;
    Ok(success_one_ok(doc))
}

pub async fn update(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path((path_segment, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let entry = catalog_model(&state, &path_segment, "update")?;
    let doc_id = parse_id(&id)?;
    let patch = body_to_map(body)?;
    let model = ctx.get_model(&entry.name, entry.schema.clone()).await?;
    let doc = model.update(doc_id, patch).await?.ok_or_else(|| AppError::NotFound(id))?;
    Ok(success_one_ok(doc))
}

pub async fn delete(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path((path_segment, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let entry = catalog_model(&state, &path_segment, "delete")?;
    let doc_id = parse_id(&id)?;
    let model = ctx.get_model(&entry.name, entry.schema.clone()).await?;
    if !model.delete(doc_id).await? {
        return Err(AppError::NotFound(id));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;
    use serde_json::json;

    #[test]
    fn query_values_follow_field_kind() {
        let schema = ModelSchema::new()
            .field("qty", FieldDef::new(FieldKind::Integer))
            .field("price", FieldDef::new(FieldKind::Number))
            .field("paid", FieldDef::new(FieldKind::Boolean))
            .field("status", FieldDef::new(FieldKind::String));
        assert_eq!(query_value_for_field(&schema, "qty", "3"), json!(3));
        assert_eq!(query_value_for_field(&schema, "qty", "three"), json!("three"));
        assert_eq!(query_value_for_field(&schema, "price", "2.5"), json!(2.5));
        assert_eq!(query_value_for_field(&schema, "paid", "TRUE"), json!(true));
        assert_eq!(query_value_for_field(&schema, "status", "42"), json!("42"));
        assert_eq!(query_value_for_field(&schema, "unknown", "x"), json!("x"));
    }

    #[test]
    fn ids_must_be_uuids() {
        assert!(parse_id("not-a-uuid").is_err());
        assert!(parse_id(&Uuid::new_v4().to_string()).is_ok());
    }
}
