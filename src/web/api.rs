//! REST API endpoints

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::receiver::ReceiverState;
use crate::AppState;

/// File name viewers save the model as
const MODEL_FILE_NAME: &str = "default.vrm";

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

impl ApiResponse<()> {
    pub fn error(message: &str) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(message.to_string()),
        })
    }

    pub fn ok() -> Json<Self> {
        Json(Self {
            success: true,
            data: None,
            error: None,
        })
    }
}

/// Serve the VRM model as a download
pub async fn get_model(State(state): State<Arc<AppState>>) -> Response {
    let path = &state.config.files.vrm_path;

    match tokio::fs::read(path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", MODEL_FILE_NAME),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Model file {} not found", path.display());
            (StatusCode::NOT_FOUND, ApiResponse::error("Model file not found")).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to read model file {}: {}", path.display(), e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error(&e.to_string()),
            )
                .into_response()
        }
    }
}

/// Replace the VRM model with the request body
pub async fn put_model(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let path = &state.config.files.vrm_path;

    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, ApiResponse::error("Empty model body")).into_response();
    }

    match tokio::fs::write(path, &body).await {
        Ok(()) => {
            tracing::info!("Saved {} byte model to {}", body.len(), path.display());
            ApiResponse::<()>::ok().into_response()
        }
        Err(e) => {
            tracing::error!("Failed to write model file {}: {}", path.display(), e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error(&e.to_string()),
            )
                .into_response()
        }
    }
}

/// Persist the current camera to the scene file
pub async fn put_scene(State(state): State<Arc<AppState>>) -> Response {
    let scene = state.relay.scene();
    let path = state.config.files.scene_path.clone();

    let result = tokio::task::spawn_blocking(move || scene.save(&path)).await;
    match result {
        Ok(Ok(())) => ApiResponse::<()>::ok().into_response(),
        Ok(Err(e)) => {
            tracing::error!("{}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error(&e.to_string()),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Scene save task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error("Scene save failed"),
            )
                .into_response()
        }
    }
}

/// Get the running configuration
pub async fn get_app_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

/// Switch the active receiver. The body is the receiver name as plain text.
pub async fn change_receiver(State(state): State<Arc<AppState>>, body: String) -> Response {
    let name = body.trim();

    match state.relay.switch_active(name) {
        Ok(()) => ApiResponse::success(state.relay.active_name()).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, ApiResponse::error(&e.to_string())).into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct ReceiverInfo {
    pub name: String,
    pub state: ReceiverState,
    pub active: bool,
}

/// Receiver status response
#[derive(Debug, Serialize)]
pub struct ReceiverStatus {
    pub active: String,
    pub receivers: Vec<ReceiverInfo>,
    pub camera_viewers: usize,
    pub version: String,
}

/// Get the active receiver and every receiver's state
pub async fn get_receivers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let relay = &state.relay;
    let active = relay.active_name();

    let receivers = relay
        .receivers()
        .map(|r| ReceiverInfo {
            name: r.name().to_string(),
            state: r.state(),
            active: r.name() == active,
        })
        .collect();

    ApiResponse::success(ReceiverStatus {
        active,
        receivers,
        camera_viewers: relay.camera_pool().count(),
        version: crate::VERSION.to_string(),
    })
}
