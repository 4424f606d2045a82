//! HTTP control plane and the `serve` runtime loop.
//!
//! The plane is a local dev-plane API: permissive CORS, JSON bodies, and a
//! `/kill` endpoint sharing one shutdown signal with the signal handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use fleet_config::FleetConfig;

use crate::fleet::{Fleet, FleetError, TARGET_ALL};

pub const DEFAULT_PORT: u16 = 5859;
pub const DEFAULT_BIND: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Loopback by default; Docker deployments rebind `0.0.0.0`.
    pub bind: String,
    pub port: u16,
    pub config_path: PathBuf,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            config_path: FleetConfig::default_path(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    fleet: Arc<Fleet>,
    shutdown: watch::Sender<bool>,
}

/// Load the fleet, launch every child, and serve the control plane until
/// `/kill` or SIGINT/SIGTERM. Children are stopped and their workers joined
/// before this returns.
pub async fn run_serve(options: ServeOptions) -> Result<()> {
    let config = FleetConfig::load_or_default(&options.config_path);
    let fleet = Arc::new(Fleet::new(config));
    let _ = fleet.start(TARGET_ALL).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = router(AppState {
        fleet: fleet.clone(),
        shutdown: shutdown_tx,
    });

    let addr = format!("{}:{}", options.bind, options.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind control plane at {addr}"))?;
    tracing::info!(addr = %addr, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await
        .context("control plane server failed")?;

    tracing::info!("shutting down");
    let _ = fleet.stop(TARGET_ALL).await;
    fleet.shutdown().await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/tools", get(tools))
        .route("/list_tools", get(tools))
        .route("/start/{name}", post(start_child))
        .route("/stop/{name}", post(stop_child))
        .route("/call_tool", post(call_tool))
        .route("/kill", post(kill))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Resolves when `/kill` fires the shutdown signal or the process receives
/// SIGINT/SIGTERM; both take the same graceful path.
async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    let signalled = async move {
        while shutdown_rx.changed().await.is_ok() {
            if *shutdown_rx.borrow() {
                return;
            }
        }
        // Sender gone without a signal: fall through to the OS signals.
        std::future::pending::<()>().await;
    };

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to install SIGTERM handler");
                    signalled.await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = signalled => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = signalled => {}
        }
    }
}

async fn status(State(state): State<AppState>) -> Json<Map<String, Value>> {
    Json(state.fleet.status().await)
}

async fn tools(State(state): State<AppState>) -> Json<Map<String, Value>> {
    Json(state.fleet.tools().await)
}

async fn start_child(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<Map<String, Value>>, ApiError> {
    state.fleet.start(&name).await?;
    Ok(Json(state.fleet.status().await))
}

async fn stop_child(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<Map<String, Value>>, ApiError> {
    state.fleet.stop(&name).await?;
    Ok(Json(state.fleet.status().await))
}

#[derive(Debug, Deserialize)]
struct CallToolBody {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

async fn call_tool(
    State(state): State<AppState>,
    Json(body): Json<CallToolBody>,
) -> Result<Json<Value>, ApiError> {
    let result = state.fleet.call_tool(&body.name, body.arguments).await?;
    Ok(Json(
        serde_json::to_value(&result).unwrap_or(Value::Null),
    ))
}

/// Stop the fleet and signal the runtime; the response goes out before the
/// server drains.
async fn kill(State(state): State<AppState>) -> Json<Value> {
    let _ = state.fleet.stop(TARGET_ALL).await;
    let _ = state.shutdown.send(true);
    Json(json!({"status": "shutting-down"}))
}

struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(error: FleetError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::UnknownChild(_) | FleetError::ToolNotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Rpc(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use serde_json::{Value, json};
    use tokio::sync::watch;

    use fleet_config::FleetConfig;

    use super::{AppState, router};
    use crate::child::ChildState;
    use crate::child::tests::{mock_config, wait_for_state, write_mock_server};
    use crate::fleet::Fleet;

    async fn spawn_plane(fleet: Fleet) -> (SocketAddr, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = router(AppState {
            fleet: Arc::new(fleet),
            shutdown: shutdown_tx,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut serve_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while serve_rx.changed().await.is_ok() {
                        if *serve_rx.borrow() {
                            break;
                        }
                    }
                })
                .await
                .unwrap();
        });
        (addr, shutdown_rx)
    }

    #[tokio::test]
    async fn empty_fleet_serves_empty_maps_and_kill_signals_shutdown() -> Result<()> {
        let (addr, shutdown_rx) = spawn_plane(Fleet::new(FleetConfig::default())).await;
        let client = reqwest::Client::new();

        let status: Value = client
            .get(format!("http://{addr}/status"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(status, json!({}));

        let tools: Value = client
            .get(format!("http://{addr}/list_tools"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(tools, json!({}));

        let kill: Value = client
            .post(format!("http://{addr}/kill"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(kill, json!({"status": "shutting-down"}));
        assert!(*shutdown_rx.borrow(), "kill must raise the shutdown signal");

        // Double kill is safe even while the server drains.
        let second = client.post(format!("http://{addr}/kill")).send().await;
        if let Ok(response) = second {
            assert_eq!(response.status(), 200);
        }
        Ok(())
    }

    #[tokio::test]
    async fn unknown_names_map_to_404() -> Result<()> {
        let (addr, _shutdown_rx) = spawn_plane(Fleet::new(FleetConfig::default())).await;
        let client = reqwest::Client::new();

        let start = client
            .post(format!("http://{addr}/start/ghost"))
            .send()
            .await?;
        assert_eq!(start.status(), 404);

        let call = client
            .post(format!("http://{addr}/call_tool"))
            .json(&json!({"name": "nobody"}))
            .send()
            .await?;
        assert_eq!(call.status(), 404);
        assert!(call.text().await?.contains("nobody"));
        Ok(())
    }

    #[tokio::test]
    async fn lifecycle_and_call_tool_round_trip_over_http() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let script = write_mock_server(temp.path(), "mock-mcp.sh")?;
        let fleet = Fleet::new(FleetConfig {
            servers: vec![mock_config(&script, "mock", "echo_tool")],
        });
        let (addr, _shutdown_rx) = spawn_plane(fleet).await;
        let client = reqwest::Client::new();

        let status: Value = client
            .post(format!("http://{addr}/start/mock"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(status["mock"]["transport"], "stdio");

        // /start only enqueues; poll /status until the child stabilizes.
        let deadline = std::time::Instant::now() + Duration::from_secs(15);
        loop {
            let status: Value = client
                .get(format!("http://{addr}/status"))
                .send()
                .await?
                .json()
                .await?;
            if status["mock"]["state"] == "running" {
                assert_eq!(status["mock"]["healthy"], true);
                assert_eq!(status["mock"]["tool_count"], 1);
                assert!(status["mock"]["pid"].as_u64().is_some_and(|pid| pid > 0));
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "child never reached running over HTTP: {status}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let result: Value = client
            .post(format!("http://{addr}/call_tool"))
            .json(&json!({"name": "echo_tool", "arguments": {"x": 1}}))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(result["content"][0]["text"], "pong");

        let stopped: Value = client
            .post(format!("http://{addr}/stop/mock"))
            .send()
            .await?
            .json()
            .await?;
        let state = stopped["mock"]["state"].as_str().unwrap_or_default();
        assert!(
            state == "stopping" || state == "stopped",
            "unexpected state after stop: {state}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn kill_stops_children_before_signalling() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let script = write_mock_server(temp.path(), "mock-mcp.sh")?;
        let fleet = Fleet::new(FleetConfig {
            servers: vec![mock_config(&script, "mock", "echo_tool")],
        });
        let fleet = Arc::new(fleet);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = router(AppState {
            fleet: fleet.clone(),
            shutdown: shutdown_tx,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let mut rx = shutdown_rx;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while rx.changed().await.is_ok() {
                        if *rx.borrow() {
                            break;
                        }
                    }
                })
                .await
                .unwrap();
        });

        fleet.start("mock").await?;
        let child = fleet.child("mock").unwrap();
        assert!(wait_for_state(child, ChildState::Running, Duration::from_secs(15)).await);

        let kill: Value = reqwest::Client::new()
            .post(format!("http://{addr}/kill"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(kill["status"], "shutting-down");
        assert!(wait_for_state(child, ChildState::Stopped, Duration::from_secs(10)).await);
        assert!(child.info().pid.is_none());
        Ok(())
    }
}
