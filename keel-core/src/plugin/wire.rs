//! Transport constants shared by the agent and the plugin SDK
//!
//! Plugins serve JSON over HTTP on a loopback socket. Unary verbs reply with
//! an [`RpcReply`](super::RpcReply); `ExecuteStage` replies with
//! newline-delimited [`ExecuteStageFrame`](super::ExecuteStageFrame)s.

/// Env var carrying the plugin's configured name
pub const ENV_PLUGIN_NAME: &str = "KEEL_PLUGIN_NAME";
/// Env var carrying the per-launch shared secret
pub const ENV_PLUGIN_SECRET: &str = "KEEL_PLUGIN_SECRET";
/// Env var carrying the agent callback base URL
pub const ENV_CALLBACK_URL: &str = "KEEL_AGENT_CALLBACK_URL";

/// Header every request on either side must carry
pub const SECRET_HEADER: &str = "x-keel-plugin-secret";
/// Header identifying the calling plugin on agent callbacks
pub const PLUGIN_NAME_HEADER: &str = "x-keel-plugin-name";

/// Prefix of the single stdout line a plugin prints once it listens
pub const READY_PREFIX: &str = "KEEL_PLUGIN_READY";

pub const HEALTHZ: &str = "/healthz";
pub const FETCH_DEFINED_STAGES: &str = "/v1/deployment/fetch-defined-stages";
pub const DETERMINE_VERSIONS: &str = "/v1/deployment/determine-versions";
pub const DETERMINE_STRATEGY: &str = "/v1/deployment/determine-strategy";
pub const BUILD_PIPELINE_SYNC_STAGES: &str = "/v1/deployment/build-pipeline-sync-stages";
pub const BUILD_QUICK_SYNC_STAGES: &str = "/v1/deployment/build-quick-sync-stages";
pub const EXECUTE_STAGE: &str = "/v1/deployment/execute-stage";
pub const GET_LIVESTATE: &str = "/v1/livestate/get-livestate";

/// Path to cancel a running `ExecuteStage` call
pub fn cancel_execution_path(execution_id: &str) -> String {
    format!("/v1/deployment/executions/{}/cancel", execution_id)
}

/// Agent callback path listing stage commands
pub fn stage_commands_path(deployment_id: &str, stage_id: &str) -> String {
    format!("/v1/stages/{}/{}/commands", deployment_id, stage_id)
}

/// Parse the handshake line; `None` if the line is something else
pub fn parse_ready_line(line: &str) -> Option<std::net::SocketAddr> {
    let rest = line.trim().strip_prefix(READY_PREFIX)?;
    rest.trim().parse().ok()
}
