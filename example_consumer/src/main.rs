//! Example consumer: a document server where every request reaches only its own tenant's database.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Tenants are configured through env, e.g.
//! `TENANT_RULES="brandx=brandx" TENANT_BRANDX_DATABASE_URL=postgres://localhost/brandx`.

use std::sync::Arc;
use std::time::Duration;
use tenancy_sdk::{
    app_router, build_config_source, init_tracing, AnyDriver, AppState, DatabaseDriver, ModelCatalog, Settings,
    TenantConnectionRegistry, TenantLayer, TenantModelRegistry,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("tenancy_sdk=info,example_consumer=info,tower_http=info");

    let settings = Settings::from_env()?;
    let source = build_config_source(&settings.config_location).await?;
    let driver: Arc<dyn DatabaseDriver> = Arc::new(AnyDriver::new());
    let connections = Arc::new(TenantConnectionRegistry::new(driver, source, settings.registry_options()));
    let models = Arc::new(TenantModelRegistry::new(connections));

    let sweeper = match (settings.idle_timeout, settings.sweep_interval()) {
        (Some(idle), Some(every)) => Some(models.spawn_idle_sweeper(every, idle)),
        _ => None,
    };

    let catalog = match &settings.models_path {
        Some(path) => ModelCatalog::load_file(path).await?,
        None => ModelCatalog::default(),
    };
    if catalog.is_empty() {
        tracing::warn!("no models configured (set MODELS_PATH); only /health, /ready and /version are useful");
    }

    let tenancy = TenantLayer::new(Arc::new(settings.resolver()?), models.clone());
    let app = app_router(AppState::new(catalog), tenancy);

    let listener = TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        default_tenant = %settings.default_tenant,
        rules = settings.rules.len(),
        "example consumer listening"
    );
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    tokio::time::timeout(Duration::from_secs(10), models.shutdown())
        .await
        .unwrap_or_else(|_| tracing::warn!("timed out closing tenant connections"));
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
