//! Route definitions

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::HttpConfig;
use crate::AppState;

use super::{api, ws};

/// Largest VRM upload accepted by `PUT /api/model`
pub const MAX_MODEL_BYTES: usize = 256 * 1024 * 1024;

/// Create the main router with all routes
pub fn create_router(app_state: Arc<AppState>, config: &HttpConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    let mut router = Router::new()
        // Viewer sockets
        .route("/client/camera", get(ws::camera_socket))
        .route("/client/model", get(ws::model_socket))
        // API endpoints
        .route(
            "/api/model",
            get(api::get_model)
                .put(api::put_model)
                .layer(DefaultBodyLimit::max(MAX_MODEL_BYTES)),
        )
        .route("/api/config/scene", put(api::put_scene))
        .route("/api/config/app", get(api::get_app_config))
        .route("/api/receiver", get(api::get_receivers))
        .route("/api/receiver/change", post(api::change_receiver));

    // Frontend
    if let Some(dir) = &config.frontend_dir {
        tracing::info!("Serving frontend from {}", dir.display());
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
