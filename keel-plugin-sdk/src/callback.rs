//! Client for the agent callback API

use async_trait::async_trait;
use keel_core::Code;
use keel_core::domain::command::StageCommand;
use keel_core::plugin::{PluginResult, PluginStatus, RpcReply, StageCommandSource, wire};
use reqwest::Client;

use crate::server::PluginEnv;

/// Reads stage commands the agent holds for this plugin
#[derive(Debug, Clone)]
pub struct AgentCallbackClient {
    base_url: String,
    plugin_name: String,
    secret: String,
    client: Client,
}

impl AgentCallbackClient {
    pub fn new(
        base_url: impl Into<String>,
        plugin_name: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            plugin_name: plugin_name.into(),
            secret: secret.into(),
            client: Client::new(),
        }
    }

    pub fn from_env(env: &PluginEnv) -> Self {
        Self::new(&env.callback_url, &env.name, &env.secret)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl StageCommandSource for AgentCallbackClient {
    async fn list_stage_commands(
        &self,
        deployment_id: &str,
        stage_id: &str,
    ) -> PluginResult<Vec<StageCommand>> {
        let url = format!(
            "{}{}",
            self.base_url,
            wire::stage_commands_path(deployment_id, stage_id)
        );
        let response = self
            .client
            .get(&url)
            .header(wire::SECRET_HEADER, &self.secret)
            .header(wire::PLUGIN_NAME_HEADER, &self.plugin_name)
            .send()
            .await
            .map_err(|e| PluginStatus::unavailable(format!("agent callback unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let code = if status.as_u16() == 401 {
                Code::FailedPrecondition
            } else if status.is_server_error() {
                Code::Unavailable
            } else {
                Code::Internal
            };
            return Err(PluginStatus::new(
                code,
                format!("agent callback returned {}", status),
            ));
        }

        response
            .json::<RpcReply<Vec<StageCommand>>>()
            .await
            .map_err(|e| PluginStatus::internal(format!("bad agent callback reply: {}", e)))?
            .into_result()
    }
}
