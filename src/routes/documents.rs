//! Document CRUD routes. Handlers resolve the model by path segment from the catalog.

use crate::handlers::documents::{create, delete as delete_handler, list, read, update};
use crate::state::AppState;
use axum::{routing::get, Router};

pub fn document_routes(state: AppState) -> Router {
    Router::new()
        .route("/:path_segment", get(list).post(create))
        .route("/:path_segment/:id", get(read).patch(update).delete(delete_handler))
        .with_state(state)
}
