//! HTTP and WebSocket surface.

use crate::broadcaster::{Broadcaster, ClientMessage, ServerMessage, Topic};
use crate::coordinator::{CampLifecycle, Coordinator, HealthSnapshot, LifecycleAction, LoadOutcome, UnloadOutcome};
use crate::error::ApiError;
use crate::ingress::{HandlerResult, WebhookIngress};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use rollcall_core::{CampId, LoadedIndexState};
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<WebhookIngress>,
    pub coordinator: Coordinator,
    pub broadcaster: Arc<Broadcaster>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/face-recognition/webhook", post(webhook))
        .route("/api/ws", get(websocket_handler))
        .route("/api/camps/lifecycle", post(lifecycle))
        .route("/api/camps/:camp_id/index", get(index_state))
        .route("/api/camps/:camp_id/index/load", post(load_index))
        .route("/api/camps/:camp_id/index/unload", post(unload_index))
        .route("/api/health", get(health))
        .with_state(state)
}

async fn webhook(State(state): State<AppState>, body: Bytes) -> (axum::http::StatusCode, Json<HandlerResult>) {
    let result = state.ingress.handle_webhook(&body).await;
    (result.status(), Json(result))
}

#[derive(Debug, Default, Deserialize)]
struct LoadParams {
    #[serde(default)]
    force: bool,
}

async fn load_index(
    State(state): State<AppState>,
    Path(camp_id): Path<i64>,
    Query(params): Query<LoadParams>,
) -> Result<Json<LoadOutcome>, ApiError> {
    let outcome = state
        .coordinator
        .request_load(CampId(camp_id), params.force)
        .await?;
    Ok(Json(outcome))
}

async fn unload_index(
    State(state): State<AppState>,
    Path(camp_id): Path<i64>,
) -> Result<Json<UnloadOutcome>, ApiError> {
    Ok(Json(state.coordinator.request_unload(CampId(camp_id)).await?))
}

async fn index_state(State(state): State<AppState>, Path(camp_id): Path<i64>) -> Json<LoadedIndexState> {
    Json(state.coordinator.state(CampId(camp_id)))
}

async fn lifecycle(
    State(state): State<AppState>,
    Json(event): Json<CampLifecycle>,
) -> Result<Json<LifecycleAction>, ApiError> {
    Ok(Json(state.coordinator.apply_lifecycle(event).await?))
}

async fn health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.coordinator.health_snapshot().await)
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state.broadcaster))
}

async fn handle_websocket(socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut rx) = broadcaster.register().await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let hub = broadcaster.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => handle_client_message(&hub, conn_id, &text).await,
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "websocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    join_first(send_task, recv_task).await;
    broadcaster.unregister(&conn_id).await;
}

/// Wait for either half of a connection to finish and abort the other.
async fn join_first(mut a: JoinHandle<()>, mut b: JoinHandle<()>) {
    tokio::select! {
        _ = &mut a => b.abort(),
        _ = &mut b => a.abort(),
    }
}

async fn handle_client_message(broadcaster: &Broadcaster, conn_id: Uuid, text: &str) {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::SubscribeToActivitySchedule {
            activity_schedule_id,
        }) => {
            broadcaster
                .subscribe(&conn_id, Topic::attendance(activity_schedule_id))
                .await;
            ServerMessage::Subscribed {
                activity_schedule_id,
            }
        }
        Ok(ClientMessage::UnsubscribeFromActivitySchedule {
            activity_schedule_id,
        }) => {
            broadcaster
                .unsubscribe(&conn_id, &Topic::attendance(activity_schedule_id))
                .await;
            ServerMessage::Unsubscribed {
                activity_schedule_id,
            }
        }
        Ok(ClientMessage::Ping) => ServerMessage::Pong,
        Err(e) => {
            tracing::debug!(connection_id = %conn_id, error = %e, "unrecognised client frame");
            ServerMessage::Error {
                message: format!("unrecognised message: {e}"),
            }
        }
    };
    if let Err(e) = broadcaster.send_to(&conn_id, &reply).await {
        tracing::warn!(connection_id = %conn_id, error = %e, "failed to reply to client");
    }
}
