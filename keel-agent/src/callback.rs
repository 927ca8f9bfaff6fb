//! Agent callback API
//!
//! Plugins call back into the agent to read the stage commands (approvals)
//! held for a stage. Requests must carry the calling plugin's name and the
//! secret it was launched with.

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use keel_core::domain::command::StageCommand;
use keel_core::plugin::{PluginResult, RpcReply, StageCommandSource, wire};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

type StageKey = (String, String);

/// Stage commands waiting for plugins to read them
#[derive(Debug, Default)]
pub struct StageCommandStore {
    commands: RwLock<HashMap<StageKey, Vec<StageCommand>>>,
}

impl StageCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a command; a repeated command ID is ignored
    pub fn add(&self, command: StageCommand) {
        let mut commands = self.commands.write().unwrap_or_else(PoisonError::into_inner);
        let held = commands
            .entry((command.deployment_id.clone(), command.stage_id.clone()))
            .or_default();
        if held.iter().any(|c| c.command_id == command.command_id) {
            return;
        }
        debug!(deployment_id = %command.deployment_id, stage_id = %command.stage_id, commander = %command.commander, "Holding stage command");
        held.push(command);
    }

    pub fn list(&self, deployment_id: &str, stage_id: &str) -> Vec<StageCommand> {
        let commands = self.commands.read().unwrap_or_else(PoisonError::into_inner);
        commands
            .get(&(deployment_id.to_string(), stage_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop everything held for a finished deployment
    pub fn forget(&self, deployment_id: &str) {
        let mut commands = self.commands.write().unwrap_or_else(PoisonError::into_inner);
        commands.retain(|(d, _), _| d != deployment_id);
    }
}

#[async_trait]
impl StageCommandSource for StageCommandStore {
    async fn list_stage_commands(&self, deployment_id: &str, stage_id: &str) -> PluginResult<Vec<StageCommand>> {
        Ok(self.list(deployment_id, stage_id))
    }
}

#[derive(Clone)]
struct CallbackState {
    commands: Arc<StageCommandStore>,
    /// Plugin name to launch secret
    secrets: Arc<BTreeMap<String, String>>,
}

pub fn router(commands: Arc<StageCommandStore>, secrets: BTreeMap<String, String>) -> Router {
    let state = CallbackState {
        commands,
        secrets: Arc::new(secrets),
    };
    Router::new()
        .route("/v1/stages/{deployment_id}/{stage_id}/commands", get(list_stage_commands))
        .layer(middleware::from_fn_with_state(state.clone(), require_plugin))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the callback API until `shutdown` fires
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Callback API listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn require_plugin(State(state): State<CallbackState>, req: Request, next: Next) -> Response {
    let authorized = {
        let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
        match (header(wire::PLUGIN_NAME_HEADER), header(wire::SECRET_HEADER)) {
            (Some(name), Some(secret)) => state.secrets.get(name).is_some_and(|s| s == secret),
            _ => false,
        }
    };
    if !authorized {
        warn!(path = %req.uri().path(), "Rejected callback with bad plugin credentials");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(req).await
}

/// GET /v1/stages/{deployment_id}/{stage_id}/commands
async fn list_stage_commands(
    State(state): State<CallbackState>,
    Path((deployment_id, stage_id)): Path<(String, String)>,
) -> Json<RpcReply<Vec<StageCommand>>> {
    Json(RpcReply::Ok {
        value: state.commands.list(&deployment_id, &stage_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request as HttpRequest;
    use chrono::Utc;
    use tower::ServiceExt;

    fn approval(id: &str, commander: &str) -> StageCommand {
        StageCommand {
            command_id: id.into(),
            deployment_id: "d1".into(),
            stage_id: "stage-1".into(),
            commander: commander.into(),
            created_at: Utc::now(),
        }
    }

    fn app(store: Arc<StageCommandStore>) -> Router {
        router(store, BTreeMap::from([("wait".to_string(), "s3cret".to_string())]))
    }

    fn request(name: &str, secret: &str) -> HttpRequest<Body> {
        HttpRequest::get(wire::stage_commands_path("d1", "stage-1"))
            .header(wire::PLUGIN_NAME_HEADER, name)
            .header(wire::SECRET_HEADER, secret)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_store_dedupes_and_forgets() {
        let store = StageCommandStore::new();
        store.add(approval("c1", "alice"));
        store.add(approval("c1", "alice"));
        store.add(approval("c2", "bob"));
        assert_eq!(store.list("d1", "stage-1").len(), 2);
        assert!(store.list("d1", "stage-2").is_empty());

        store.forget("d1");
        assert!(store.list("d1", "stage-1").is_empty());
    }

    #[tokio::test]
    async fn test_lists_commands_for_authorized_plugin() {
        let store = Arc::new(StageCommandStore::new());
        store.add(approval("c1", "alice"));

        let response = app(store).oneshot(request("wait", "s3cret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: RpcReply<Vec<StageCommand>> = serde_json::from_slice(&body).unwrap();
        let commands = reply.into_result().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].commander, "alice");
    }

    #[tokio::test]
    async fn test_rejects_bad_secret() {
        let store = Arc::new(StageCommandStore::new());
        let response = app(Arc::clone(&store)).oneshot(request("wait", "wrong")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(Arc::clone(&store)).oneshot(request("kube", "s3cret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let anonymous = HttpRequest::get(wire::stage_commands_path("d1", "stage-1"))
            .body(Body::empty())
            .unwrap();
        let response = app(store).oneshot(anonymous).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
