//! Viewer WebSockets
//!
//! Camera viewers share one camera through the relay's broadcast pool. Pose
//! viewers get the active receiver's snapshot pushed at the update frequency.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::pose::Camera;
use crate::AppState;

/// `GET /client/camera`
pub async fn camera_socket(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_camera(socket, state))
}

async fn handle_camera(socket: WebSocket, state: Arc<AppState>) {
    let relay = Arc::clone(&state.relay);
    let mut shutdown_rx = state.subscribe_shutdown();

    // The pool callback only hands off; the writer task does the socket I/O
    let (tx, mut rx) = mpsc::unbounded_channel::<Camera>();
    let subscriber = relay.camera_pool().create(move |camera: &Camera| {
        let _ = tx.send(*camera);
    });
    let id = subscriber.id();
    relay.camera_pool().log_count();

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(camera) = rx.recv().await {
            let json = match serde_json::to_string(&camera) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize camera: {}", e);
                    continue;
                }
            };

            if let Err(e) = sender.send(Message::Text(json)).await {
                debug!("Camera viewer {} write failed: {}", id, e);
                break;
            }
        }
    });

    // Bring every viewer, this one included, to the current camera
    relay.broadcast_camera();

    let recv_relay = Arc::clone(&relay);
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<Camera>(&text) {
                    Ok(camera) => recv_relay.set_camera(camera),
                    Err(e) => warn!("Invalid camera from viewer {}: {}", id, e),
                },
                Ok(Message::Close(_)) => {
                    debug!("Camera viewer {} closed the connection", id);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Camera viewer {} read failed: {}", id, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        _ = shutdown_rx.recv() => {
            send_task.abort();
            recv_task.abort();
        }
    }

    subscriber.delete();
    relay.camera_pool().log_count();
}

/// `GET /client/model`
pub async fn model_socket(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_model(socket, state))
}

async fn handle_model(mut socket: WebSocket, state: Arc<AppState>) {
    let mut shutdown_rx = state.subscribe_shutdown();
    let mut interval = tokio::time::interval(state.relay.push_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!("Pose viewer connected");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let json = match serde_json::to_string(&state.relay.pose_snapshot()) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize pose: {}", e);
                        continue;
                    }
                };

                if let Err(e) = socket.send(Message::Text(json)).await {
                    debug!("Pose viewer write failed: {}", e);
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("Pose viewer read failed: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = shutdown_rx.recv() => break,
        }
    }

    debug!("Pose viewer disconnected");
}
