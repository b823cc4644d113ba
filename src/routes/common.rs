//! Common routes: health, readiness, version.

use crate::extractors::TenantContext;
use axum::{http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    tenant: String,
    database: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

/// Readiness of the request's tenant: opens its connection if needed and pings it.
async fn ready(ctx: TenantContext) -> Result<Json<ReadyBody>, (StatusCode, Json<ReadyBody>)> {
    let tenant = ctx.tenant_id().to_string();
    if let Err(e) = ctx.ping().await {
        tracing::warn!(tenant = %tenant, error = %e, "readiness check failed");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyBody {
                status: "degraded",
                tenant,
                database: "unavailable",
            }),
        ));
    }
    Ok(Json(ReadyBody {
        status: "ok",
        tenant,
        database: "ok",
    }))
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /health, GET /version, GET /ready. `/ready` needs the tenant middleware.
pub fn common_routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/version", get(version))
}
