//! API route modules.

pub mod extract;
pub mod health;
pub mod jobs;
pub mod probe;

use axum::Router;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::openapi::ApiDoc;
use crate::api::server::AppState;
use utoipa::OpenApi;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/extract", extract::router())
        .nest("/api/jobs", jobs::router())
        .nest("/api/probe", probe::router())
        .nest("/health", health::router())
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}
