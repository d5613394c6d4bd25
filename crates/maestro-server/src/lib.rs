//! Maestro Server Library
//!
//! Provides the HTTP/WebSocket surface for driving orchestration runs and
//! managing agents remotely.

pub mod routes;
pub mod state;

use axum::{
    response::{Html, IntoResponse, Json},
    routing::{get, post},
    Router,
};
use maestro_core::OrchestrationService;
use std::net::SocketAddr;
use std::sync::Once;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use state::AppState;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing subscriber (only once)
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| {
                    "maestro=info,maestro_core=info,maestro_server=debug,tower_http=debug".into()
                }),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

/// Build the Axum router with all routes
fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_html))
        // API routes
        .route("/api/health", get(health_check))
        .route(
            "/api/agents",
            get(routes::list_agents).post(routes::create_agent),
        )
        .route(
            "/api/agents/:id",
            get(routes::get_agent)
                .put(routes::update_agent)
                .delete(routes::delete_agent),
        )
        // Orchestration routes
        .route("/api/runs", post(routes::start_run))
        .route("/api/runs/stop", post(routes::stop_run))
        .route("/api/runs/status", get(routes::run_status))
        .route("/api/settings", get(routes::get_settings))
        .route("/api/events", get(routes::events_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the Maestro web server on the specified port
pub async fn run_server(port: u16) -> anyhow::Result<()> {
    // Initialize tracing (if not already done)
    init_tracing();

    tracing::info!("Starting Maestro Server...");

    // Load configuration
    let cwd = std::env::current_dir()?;
    let config = maestro_core::load_config(&cwd).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        Default::default()
    });

    let service = OrchestrationService::from_config(&config)?;
    serve(service, port).await
}

/// Serve an already constructed service
pub async fn serve(service: OrchestrationService, port: u16) -> anyhow::Result<()> {
    let state = AppState::new(service);
    state.spawn_notification_pump();

    let app = build_router(state);

    // Bind and serve
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Event stream: ws://{}/api/events", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": maestro_core::version()
    }))
}

async fn index_html() -> impl IntoResponse {
    Html(
        r#"
<!DOCTYPE html>
<html>
<head>
    <title>Maestro</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #1a1a2e;
            color: #eee;
            margin: 2rem;
        }
        h1 { color: #00d4ff; }
        code {
            background: #0f3460;
            padding: 0.2rem 0.5rem;
            border-radius: 4px;
        }
    </style>
</head>
<body>
    <h1>Maestro Server</h1>
    <h3>API Endpoints:</h3>
    <ul>
        <li><code>GET /api/health</code> - Health check</li>
        <li><code>GET|POST /api/agents</code> - List or create agents</li>
        <li><code>GET|PUT|DELETE /api/agents/:id</code> - Read, save or delete an agent</li>
        <li><code>POST /api/runs</code> - Start an orchestration run</li>
        <li><code>POST /api/runs/stop</code> - Stop the active run</li>
        <li><code>GET /api/runs/status</code> - Run phase and last report</li>
        <li><code>GET /api/settings</code> - Model settings</li>
        <li><code>WS /api/events</code> - Notification stream</li>
    </ul>
</body>
</html>
    "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use maestro_core::{
        ApiKeyPool, GatewayError, Invocation, ModelGateway, NewAgent, SharedGateway, Studio,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct CompletingGateway;

    #[async_trait]
    impl ModelGateway for CompletingGateway {
        async fn invoke(&self, _invocation: Invocation) -> Result<String, GatewayError> {
            Ok("TASK COMPLETE. Final Output: done".to_string())
        }
    }

    /// Never finishes on its own; runs end by budget or stop
    struct ThinkingGateway;

    #[async_trait]
    impl ModelGateway for ThinkingGateway {
        async fn invoke(&self, _invocation: Invocation) -> Result<String, GatewayError> {
            Ok("I am thinking...".to_string())
        }
    }

    fn test_state() -> (AppState, String) {
        test_state_with(Arc::new(CompletingGateway))
    }

    fn test_state_with(gateway: SharedGateway) -> (AppState, String) {
        let mut studio = Studio::default();
        studio.keys = ApiKeyPool::from_keys(["key-aaaaaaaaaa"]);
        let master = studio
            .create_agent(NewAgent {
                name: "Master".to_string(),
                system_prompt: "You orchestrate.".to_string(),
                model: None,
            })
            .unwrap();
        let service = OrchestrationService::new(studio, gateway);
        (AppState::new(service), master.id.to_string())
    }

    async fn call(
        state: &AppState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = test_state();
        let (status, json) = call(&state, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_agent_crud() {
        let (state, _) = test_state();

        let (status, json) = call(
            &state,
            "POST",
            "/api/agents",
            Some(serde_json::json!({ "name": "Poet", "system_prompt": "Write poems." })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json["agent"]["id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &state,
            "POST",
            "/api/agents",
            Some(serde_json::json!({ "name": "poet" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = call(
            &state,
            "PUT",
            &format!("/api/agents/{}", id),
            Some(serde_json::json!({
                "name": "Poet",
                "systemPrompt": "Write limericks.",
                "model": "models/gemini-1.5-pro-latest"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["created"], false);

        let (_, json) = call(&state, "GET", &format!("/api/agents/{}", id), None).await;
        assert_eq!(json["agent"]["systemPrompt"], "Write limericks.");

        let (_, json) = call(&state, "GET", "/api/agents", None).await;
        assert_eq!(json["agents"].as_array().unwrap().len(), 2);

        let (status, _) = call(&state, "DELETE", &format!("/api/agents/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&state, "GET", &format!("/api/agents/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_request() {
        let (state, master) = test_state();

        let (status, json) = call(
            &state,
            "POST",
            "/api/runs",
            Some(serde_json::json!({ "orchestrator": master, "goal": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("High-Level Goal for Master AI is missing"));

        let (status, _) = call(
            &state,
            "POST",
            "/api/runs",
            Some(serde_json::json!({ "orchestrator": "agent_missing", "goal": "g" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_run_accepted_and_reported() {
        let (state, master) = test_state();

        let (status, json) = call(
            &state,
            "POST",
            "/api/runs",
            Some(serde_json::json!({ "orchestrator": master, "goal": "Write a haiku" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["max_iterations"], 30);

        let report = loop {
            let (_, json) = call(&state, "GET", "/api/runs/status", None).await;
            if !json["last_report"].is_null() {
                break json["last_report"].clone();
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(report["status"], "completed");
        assert_eq!(report["finalOutput"], "done");

        let (_, json) = call(&state, "POST", "/api/runs/stop", None).await;
        assert_eq!(json["stopping"], false);
    }

    async fn wait_for_report(state: &AppState) -> serde_json::Value {
        loop {
            let (_, json) = call(state, "GET", "/api/runs/status", None).await;
            if !json["last_report"].is_null() {
                return json["last_report"].clone();
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let (state, master) = test_state_with(Arc::new(ThinkingGateway));
        let body = serde_json::json!({
            "orchestrator": master,
            "goal": "Write a haiku",
            "maxIterations": 5
        });

        let (status, _) = call(&state, "POST", "/api/runs", Some(body.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, json) = call(&state, "POST", "/api/runs", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["success"], false);

        let (_, json) = call(&state, "POST", "/api/runs/stop", None).await;
        assert_eq!(json["stopping"], true);
        wait_for_report(&state).await;
    }

    #[tokio::test]
    async fn test_stop_right_after_start_is_honored() {
        let (state, master) = test_state_with(Arc::new(ThinkingGateway));

        let (status, _) = call(
            &state,
            "POST",
            "/api/runs",
            Some(serde_json::json!({
                "orchestrator": master,
                "goal": "Write a haiku",
                "maxIterations": 5
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (_, json) = call(&state, "GET", "/api/runs/status", None).await;
        assert_eq!(json["phase"], "running");
        let (_, json) = call(&state, "POST", "/api/runs/stop", None).await;
        assert_eq!(json["stopping"], true);

        let report = wait_for_report(&state).await;
        assert_eq!(report["status"], "aborted");
        assert_eq!(report["abortReason"]["kind"], "cancelled");
        assert_eq!(report["iterations"], 0);

        let (_, json) = call(&state, "GET", "/api/runs/status", None).await;
        assert_eq!(json["running"], false);
    }

    #[tokio::test]
    async fn test_settings_masks_keys() {
        let (state, _) = test_state();
        let (_, json) = call(&state, "GET", "/api/settings", None).await;
        assert_eq!(json["keys"]["count"], 1);
        assert_eq!(json["keys"]["selected"], serde_json::Value::Null);
        assert_eq!(
            json["settings"]["defaultModel"],
            "models/gemini-1.5-flash-latest"
        );
    }
}
