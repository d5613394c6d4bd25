//! API route handlers

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use maestro_core::{
    mask_key, Agent, AgentId, MaestroError, NewAgent, RegistryError, RunRequest, ValidationError,
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::state::AppState;

fn error_status(err: &MaestroError) -> StatusCode {
    match err {
        MaestroError::NotFound(_) | MaestroError::Registry(RegistryError::AgentNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        MaestroError::Validation(ValidationError::AlreadyRunning) => StatusCode::CONFLICT,
        MaestroError::Validation(_)
        | MaestroError::Registry(_)
        | MaestroError::Key(_)
        | MaestroError::Settings(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: MaestroError) -> (StatusCode, Json<serde_json::Value>) {
    (
        error_status(&err),
        Json(serde_json::json!({ "success": false, "error": err.to_string() })),
    )
}

// ========== Agent Routes ==========

/// List all agents
pub async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "agents": state.service.agents() }))
}

/// Create a new agent
pub async fn create_agent(
    State(state): State<AppState>,
    Json(req): Json<NewAgent>,
) -> impl IntoResponse {
    match state.service.create_agent(req) {
        Ok(agent) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "success": true, "agent": agent })),
        ),
        Err(e) => error_response(e),
    }
}

/// Get agent by ID
pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.service.find_agent(&AgentId::from(id)) {
        Some(agent) => (StatusCode::OK, Json(serde_json::json!({ "agent": agent }))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Agent not found" })),
        ),
    }
}

#[derive(Deserialize)]
pub struct AgentForm {
    name: String,
    #[serde(default, alias = "systemPrompt")]
    system_prompt: String,
    model: String,
}

/// Save an agent submitted from a form, creating it if the ID is new
pub async fn update_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(form): Json<AgentForm>,
) -> impl IntoResponse {
    let agent = Agent {
        id: AgentId::from(id),
        name: form.name,
        system_prompt: form.system_prompt,
        model: form.model,
    };
    match state.service.upsert_agent(agent) {
        Ok(created) => (
            if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            },
            Json(serde_json::json!({ "success": true, "created": created })),
        ),
        Err(e) => error_response(e),
    }
}

/// Delete an agent and strip it from workflows
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.service.delete_agent(&AgentId::from(id)) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "workflows_updated": outcome.workflows_updated
            })),
        ),
        Err(e) => error_response(e),
    }
}

// ========== Run Routes ==========

/// Validate a run request and start it in the background
pub async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> impl IntoResponse {
    // Slot is Running before the 202 goes out
    let handle = match state.service.prepare_run(req) {
        Ok(handle) => handle,
        Err(e) => return error_response(e),
    };

    let max_iterations = handle.max_iterations();
    let last_report = state.last_report.clone();
    tokio::spawn(async move {
        let report = handle.execute().await;
        tracing::info!(status = %report.status, iterations = report.iterations, "run finished");
        *last_report.write().await = Some(report);
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "success": true,
            "max_iterations": max_iterations
        })),
    )
}

/// Ask the active run to stop after its current step
pub async fn stop_run(State(state): State<AppState>) -> impl IntoResponse {
    let stopping = state.service.request_stop();
    Json(serde_json::json!({ "stopping": stopping }))
}

/// Run slot phase and the last finished report
pub async fn run_status(State(state): State<AppState>) -> impl IntoResponse {
    let last_report = state.last_report.read().await.clone();
    Json(serde_json::json!({
        "phase": state.service.phase(),
        "running": state.service.is_running(),
        "last_report": last_report
    }))
}

// ========== Settings Routes ==========

/// Global model settings plus a masked view of the key pool
pub async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    let keys = state.service.keys();
    Json(serde_json::json!({
        "settings": state.service.settings(),
        "keys": {
            "count": keys.len(),
            "selected": keys.last_selected().map(mask_key)
        }
    }))
}

// ========== WebSocket Handler ==========

/// WebSocket stream of service notifications
pub async fn events_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events(socket, state))
}

async fn handle_events(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    tracing::info!("Event stream connected");

    let _ = sender
        .send(Message::Text(
            serde_json::json!({
                "type": "Connected",
                "phase": state.service.phase()
            })
            .to_string(),
        ))
        .await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(notification) => {
                    let text = match serde_json::to_string(&notification) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!("Failed to serialize notification: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagging, notifications dropped");
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("Event stream closed");
                    break;
                }
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}
