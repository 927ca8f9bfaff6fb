//! Plugin-side transport
//!
//! Serves a [`Plugin`] on a loopback socket. Every route requires the shared
//! secret; `ExecuteStage` streams NDJSON frames until the stage completes.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use keel_core::plugin::wire;
use keel_core::plugin::{
    BuildPipelineSyncStagesRequest, BuildQuickSyncStagesRequest, DetermineStrategyRequest,
    DetermineVersionsRequest, ExecuteStageFrame, ExecuteStageRequest, GetLivestateRequest, Plugin,
    PluginStatus, RpcReply, StageEventSender,
};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::SdkError;

/// What the agent passes a plugin at launch
#[derive(Debug, Clone)]
pub struct PluginEnv {
    pub name: String,
    pub secret: String,
    pub callback_url: String,
}

impl PluginEnv {
    pub fn from_env() -> Result<Self, SdkError> {
        let get = |key: &'static str| std::env::var(key).map_err(|_| SdkError::MissingEnv(key));
        Ok(Self {
            name: get(wire::ENV_PLUGIN_NAME)?,
            secret: get(wire::ENV_PLUGIN_SECRET)?,
            callback_url: get(wire::ENV_CALLBACK_URL)?,
        })
    }
}

#[derive(Clone)]
struct ServerState {
    plugin: Arc<dyn Plugin>,
    secret: Arc<str>,
    /// Cancellation handles of in-flight `ExecuteStage` calls
    executions: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

/// Build the plugin router
pub fn router(plugin: Arc<dyn Plugin>, secret: impl Into<String>) -> Router {
    let state = ServerState {
        plugin,
        secret: Arc::from(secret.into()),
        executions: Arc::new(Mutex::new(HashMap::new())),
    };

    Router::new()
        .route(wire::HEALTHZ, get(healthz))
        .route(wire::FETCH_DEFINED_STAGES, post(fetch_defined_stages))
        .route(wire::DETERMINE_VERSIONS, post(determine_versions))
        .route(wire::DETERMINE_STRATEGY, post(determine_strategy))
        .route(wire::BUILD_PIPELINE_SYNC_STAGES, post(build_pipeline_sync_stages))
        .route(wire::BUILD_QUICK_SYNC_STAGES, post(build_quick_sync_stages))
        .route(wire::EXECUTE_STAGE, post(execute_stage))
        .route("/v1/deployment/executions/{id}/cancel", post(cancel_execution))
        .route(wire::GET_LIVESTATE, post(get_livestate))
        .layer(middleware::from_fn_with_state(state.clone(), require_secret))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve `plugin` the way the agent expects: bind an ephemeral loopback port,
/// announce it on stdout, and run until interrupted.
pub async fn serve<P: Plugin + 'static>(plugin: P) -> Result<(), SdkError> {
    let env = PluginEnv::from_env()?;
    let listener = TcpListener::bind("127.0.0.1:0").await.map_err(SdkError::Bind)?;
    let addr = listener.local_addr().map_err(SdkError::Bind)?;

    // The agent reads exactly this line to learn where we listen
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{} {}", wire::READY_PREFIX, addr).map_err(SdkError::Serve)?;
    stdout.flush().map_err(SdkError::Serve)?;

    info!(plugin = %env.name, %addr, "Plugin listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal.cancel();
    });

    serve_on(listener, Arc::new(plugin), &env.secret, shutdown).await
}

/// Serve on an existing listener until `shutdown` fires
pub async fn serve_on(
    listener: TcpListener,
    plugin: Arc<dyn Plugin>,
    secret: &str,
    shutdown: CancellationToken,
) -> Result<(), SdkError> {
    axum::serve(listener, router(plugin, secret))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(SdkError::Serve)
}

async fn require_secret(State(state): State<ServerState>, req: Request, next: Next) -> Response {
    let provided = req
        .headers()
        .get(wire::SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if provided != Some(&*state.secret) {
        warn!(path = %req.uri().path(), "Rejected request with bad plugin secret");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(req).await
}

fn reply<T: Serialize>(result: Result<T, PluginStatus>) -> Json<RpcReply<T>> {
    Json(result.into())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn fetch_defined_stages(State(state): State<ServerState>) -> impl IntoResponse {
    reply(state.plugin.fetch_defined_stages().await)
}

async fn determine_versions(
    State(state): State<ServerState>,
    Json(req): Json<DetermineVersionsRequest>,
) -> impl IntoResponse {
    debug!(deployment_id = %req.deployment_id, "DetermineVersions");
    reply(state.plugin.determine_versions(req).await)
}

async fn determine_strategy(
    State(state): State<ServerState>,
    Json(req): Json<DetermineStrategyRequest>,
) -> impl IntoResponse {
    debug!(deployment_id = %req.deployment_id, "DetermineStrategy");
    reply(state.plugin.determine_strategy(req).await)
}

async fn build_pipeline_sync_stages(
    State(state): State<ServerState>,
    Json(req): Json<BuildPipelineSyncStagesRequest>,
) -> impl IntoResponse {
    debug!(deployment_id = %req.deployment_id, stages = req.stages.len(), "BuildPipelineSyncStages");
    reply(state.plugin.build_pipeline_sync_stages(req).await)
}

async fn build_quick_sync_stages(
    State(state): State<ServerState>,
    Json(req): Json<BuildQuickSyncStagesRequest>,
) -> impl IntoResponse {
    debug!(deployment_id = %req.deployment_id, "BuildQuickSyncStages");
    reply(state.plugin.build_quick_sync_stages(req).await)
}

async fn get_livestate(
    State(state): State<ServerState>,
    Json(req): Json<GetLivestateRequest>,
) -> impl IntoResponse {
    reply(state.plugin.get_livestate(req).await)
}

async fn cancel_execution(State(state): State<ServerState>, Path(id): Path<String>) -> StatusCode {
    let token = state
        .executions
        .lock()
        .ok()
        .and_then(|m| m.get(&id).cloned());
    match token {
        Some(token) => {
            info!(execution_id = %id, "Cancelling stage execution");
            token.cancel();
            StatusCode::ACCEPTED
        }
        None => StatusCode::NOT_FOUND,
    }
}

fn encode_frame(frame: &ExecuteStageFrame) -> String {
    let mut line = serde_json::to_string(frame).unwrap_or_else(|e| {
        let fallback = ExecuteStageFrame::Error {
            status: PluginStatus::internal(format!("failed to encode frame: {}", e)),
        };
        serde_json::to_string(&fallback).unwrap_or_default()
    });
    line.push('\n');
    line
}

async fn execute_stage(
    State(state): State<ServerState>,
    Json(req): Json<ExecuteStageRequest>,
) -> Response {
    let execution_id = req.execution_id.clone();
    let cancel = CancellationToken::new();
    if let Ok(mut executions) = state.executions.lock() {
        executions.insert(execution_id.clone(), cancel.clone());
    }

    info!(
        deployment_id = %req.deployment_id,
        stage = %req.stage_name,
        execution_id = %execution_id,
        "Executing stage"
    );

    let (frames_tx, frames_rx) = mpsc::channel::<ExecuteStageFrame>(64);
    tokio::spawn(run_execution(state, req, cancel, frames_tx));

    let stream = futures::stream::unfold(frames_rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(encode_frame(&frame)), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Forward stage events as frames while the plugin runs, then the outcome.
/// If the agent stops reading, the execution is cancelled.
async fn run_execution(
    state: ServerState,
    req: ExecuteStageRequest,
    cancel: CancellationToken,
    frames: mpsc::Sender<ExecuteStageFrame>,
) {
    let execution_id = req.execution_id.clone();
    let (events, mut rx) = StageEventSender::channel(64);

    let exec = state.plugin.execute_stage(req, events, cancel.clone());
    tokio::pin!(exec);

    let result = loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if frames.send(ExecuteStageFrame::Event { event }).await.is_err() {
                    cancel.cancel();
                }
            }
            result = &mut exec => break result,
        }
    };

    while let Ok(event) = rx.try_recv() {
        let _ = frames.send(ExecuteStageFrame::Event { event }).await;
    }

    let last = match result {
        Ok(outcome) => ExecuteStageFrame::Completed { outcome },
        Err(status) => ExecuteStageFrame::Error { status },
    };
    let _ = frames.send(last).await;

    if let Ok(mut executions) = state.executions.lock() {
        executions.remove(&execution_id);
    }
}
