pub mod common;
pub mod documents;

pub use common::common_routes;
pub use documents::document_routes;

use crate::middleware::TenantLayer;
use crate::state::AppState;
use axum::{extract::DefaultBodyLimit, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Common and document routes behind the tenant middleware, with access logging.
pub fn app_router(state: AppState, tenancy: TenantLayer) -> Router {
    let router = Router::new().merge(common_routes()).merge(document_routes(state));
    tenancy.apply(router).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::registry::{RegistryOptions, TenantConnectionRegistry, TenantModelRegistry};
    use crate::resolver::{TenantResolver, TenantRule};
    use crate::testing::{memory_tenants, CountingDriver};
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    const CATALOG: &str = r#"[
        {"name": "News", "schema": {"fields": {
            "title": {"type": "string", "required": true, "max_length": 40},
            "views": {"type": "integer", "default": 0}
        }}},
        {"name": "Order", "path_segment": "orders", "operations": ["read"]}
    ]"#;

    fn app(driver: Arc<CountingDriver>) -> Router {
        let connections = TenantConnectionRegistry::new(
            driver,
            memory_tenants(&["brandx", "default"]),
            RegistryOptions::default(),
        );
        let models = Arc::new(TenantModelRegistry::new(Arc::new(connections)));
        let resolver = TenantResolver::new(
            &[TenantRule::new("brandx.com", "brandx"), TenantRule::new("ghost", "ghost")],
            "default",
        )
        .unwrap();
        let state = AppState::new(ModelCatalog::from_json_str(CATALOG).unwrap());
        app_router(state, TenantLayer::new(Arc::new(resolver), models))
    }

    fn request(method: Method, uri: &str, host: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri).header("host", host);
        match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn hosts_of_one_tenant_share_a_connection() {
        let driver = CountingDriver::new();
        let app = app(driver.clone());

        let (status, created) = send(
            &app,
            request(Method::POST, "/news", "shop.brandx.com", Some(json!({"title": "launch"}))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["data"]["title"], json!("launch"));
        assert_eq!(created["data"]["views"], json!(0));

        let (status, listed) = send(&app, request(Method::GET, "/news", "admin.brandx.com", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["meta"]["count"], json!(1));
        assert_eq!(listed["meta"]["total"], json!(1));
        assert_eq!(driver.opens(), 1);
    }

    #[tokio::test]
    async fn unknown_host_uses_default_tenant_data() {
        let driver = CountingDriver::new();
        let app = app(driver.clone());
        send(
            &app,
            request(Method::POST, "/news", "brandx.com", Some(json!({"title": "x only"}))),
        )
        .await;

        let (status, listed) = send(&app, request(Method::GET, "/news", "unknown.example", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"], json!([]));
        assert_eq!(driver.opens(), 2);
    }

    #[tokio::test]
    async fn document_lifecycle() {
        let app = app(CountingDriver::new());
        let host = "brandx.com";
        let (_, created) = send(
            &app,
            request(Method::POST, "/news", host, Some(json!({"title": "draft", "views": 3}))),
        )
        .await;
        let id = created["data"]["id"].as_str().unwrap().to_string();
        let path = format!("/news/{}", id);

        let (status, got) = send(&app, request(Method::GET, &path, host, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(got["data"]["views"], json!(3));

        let (status, filtered) = send(&app, request(Method::GET, "/news?views=3&limit=10", host, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(filtered["meta"]["count"], json!(1));
        assert_eq!(filtered["meta"]["limit"], json!(10));

        let (status, patched) = send(
            &app,
            request(Method::PATCH, &path, host, Some(json!({"title": "final"}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["data"]["title"], json!("final"));

        let (status, _) = send(&app, request(Method::DELETE, &path, host, None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, request(Method::GET, &path, host, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], json!("not_found"));
    }

    #[tokio::test]
    async fn client_errors_use_the_error_envelope() {
        let app = app(CountingDriver::new());
        let host = "brandx.com";

        let (status, body) = send(&app, request(Method::GET, "/widgets", host, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], json!("not_found"));

        let (status, body) = send(&app, request(Method::POST, "/news", host, Some(json!({"views": 1})))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["field"], json!("title"));

        let (status, _) = send(&app, request(Method::POST, "/orders", host, Some(json!({})))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, request(Method::GET, "/news/not-a-uuid", host, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tenant_failures_are_generic_server_errors() {
        let app = app(CountingDriver::new());
        let (status, body) = send(&app, request(Method::GET, "/news", "ghost.example", None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], json!("tenant_unavailable"));
        assert_eq!(body["error"]["message"], json!("internal server error"));
        assert!(!body.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn health_version_and_ready() {
        let app = app(CountingDriver::new());
        let (status, body) = send(&app, request(Method::GET, "/health", "brandx.com", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));

        let (_, body) = send(&app, request(Method::GET, "/version", "brandx.com", None)).await;
        assert_eq!(body["name"], json!("tenancy-sdk"));

        let (status, body) = send(&app, request(Method::GET, "/ready", "brandx.com", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tenant"], json!("brandx"));

        let (status, body) = send(&app, request(Method::GET, "/ready", "ghost.example", None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["database"], json!("unavailable"));
    }

    #[tokio::test]
    async fn routes_without_tenant_middleware_fail_loudly() {
        let app = document_routes(AppState::new(ModelCatalog::from_json_str(CATALOG).unwrap()));
        let (status, body) = send(&app, request(Method::GET, "/news", "brandx.com", None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], json!("tenant_not_resolved"));
    }
}
