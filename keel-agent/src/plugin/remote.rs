//! HTTP client for a running plugin process

use async_trait::async_trait;
use futures::StreamExt;
use keel_core::Code;
use keel_core::plugin::*;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// [`Plugin`] implementation that forwards every call to a plugin server
#[derive(Debug, Clone)]
pub struct RemotePlugin {
    name: String,
    base_url: String,
    secret: String,
    client: Client,
}

fn transport_status(err: reqwest::Error) -> PluginStatus {
    if err.is_timeout() {
        PluginStatus::new(Code::DeadlineExceeded, format!("plugin call timed out: {}", err))
    } else if err.is_decode() {
        PluginStatus::internal(format!("malformed plugin reply: {}", err))
    } else {
        PluginStatus::unavailable(format!("plugin unreachable: {}", err))
    }
}

fn http_status(status: StatusCode) -> PluginStatus {
    match status {
        StatusCode::UNAUTHORIZED => {
            PluginStatus::new(Code::FailedPrecondition, "plugin rejected the shared secret")
        }
        StatusCode::NOT_FOUND => PluginStatus::new(Code::Unimplemented, "plugin does not serve this verb"),
        s if s.is_server_error() => PluginStatus::unavailable(format!("plugin returned {}", s)),
        s => PluginStatus::internal(format!("plugin returned {}", s)),
    }
}

impl RemotePlugin {
    pub fn new(name: impl Into<String>, addr: SocketAddr, secret: impl Into<String>) -> Self {
        Self::with_base_url(name, format!("http://{}", addr), secret)
    }

    pub fn with_base_url(
        name: impl Into<String>,
        base_url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.into(),
            client: Client::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Liveness probe; any failure counts as unhealthy
    pub async fn healthz(&self, timeout: Duration) -> bool {
        let result = self
            .client
            .get(self.url(wire::HEALTHZ))
            .header(wire::SECRET_HEADER, &self.secret)
            .timeout(timeout)
            .send()
            .await;
        matches!(result, Ok(resp) if resp.status().is_success())
    }

    async fn call<Req, Resp>(&self, path: &str, req: &Req) -> PluginResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        debug!(plugin = %self.name, path, "Calling plugin");
        let response = self
            .client
            .post(self.url(path))
            .header(wire::SECRET_HEADER, &self.secret)
            .json(req)
            .send()
            .await
            .map_err(transport_status)?;

        if !response.status().is_success() {
            return Err(http_status(response.status()));
        }
        response
            .json::<RpcReply<Resp>>()
            .await
            .map_err(transport_status)?
            .into_result()
    }

    async fn cancel_execution(&self, execution_id: &str) {
        let result = self
            .client
            .post(self.url(&wire::cancel_execution_path(execution_id)))
            .header(wire::SECRET_HEADER, &self.secret)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(plugin = %self.name, execution_id, "Cancel delivered");
            }
            Ok(resp) => {
                warn!(plugin = %self.name, execution_id, status = %resp.status(), "Cancel not accepted");
            }
            Err(e) => warn!(plugin = %self.name, execution_id, error = %e, "Failed to deliver cancel"),
        }
    }
}

#[async_trait]
impl DeploymentService for RemotePlugin {
    async fn fetch_defined_stages(&self) -> PluginResult<FetchDefinedStagesResponse> {
        self.call(wire::FETCH_DEFINED_STAGES, &serde_json::json!({})).await
    }

    async fn determine_versions(
        &self,
        req: DetermineVersionsRequest,
    ) -> PluginResult<DetermineVersionsResponse> {
        self.call(wire::DETERMINE_VERSIONS, &req).await
    }

    async fn determine_strategy(
        &self,
        req: DetermineStrategyRequest,
    ) -> PluginResult<DetermineStrategyResponse> {
        self.call(wire::DETERMINE_STRATEGY, &req).await
    }

    async fn build_pipeline_sync_stages(
        &self,
        req: BuildPipelineSyncStagesRequest,
    ) -> PluginResult<BuildStagesResponse> {
        self.call(wire::BUILD_PIPELINE_SYNC_STAGES, &req).await
    }

    async fn build_quick_sync_stages(
        &self,
        req: BuildQuickSyncStagesRequest,
    ) -> PluginResult<BuildStagesResponse> {
        self.call(wire::BUILD_QUICK_SYNC_STAGES, &req).await
    }

    /// Stream NDJSON frames until a terminal frame arrives. A cancel is
    /// forwarded once and the stream keeps being read so the plugin's own
    /// terminal status is observed.
    async fn execute_stage(
        &self,
        req: ExecuteStageRequest,
        events: StageEventSender,
        cancel: CancellationToken,
    ) -> PluginResult<StageOutcome> {
        let execution_id = req.execution_id.clone();
        let response = self
            .client
            .post(self.url(wire::EXECUTE_STAGE))
            .header(wire::SECRET_HEADER, &self.secret)
            .json(&req)
            .send()
            .await
            .map_err(transport_status)?;
        if !response.status().is_success() {
            return Err(http_status(response.status()));
        }

        let mut body = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut cancel_sent = false;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    self.cancel_execution(&execution_id).await;
                    continue;
                }
                chunk = body.next() => chunk,
            };

            let Some(chunk) = chunk else {
                return Err(PluginStatus::unavailable(
                    "stage stream ended without a terminal frame",
                ));
            };
            buf.extend_from_slice(&chunk.map_err(transport_status)?);

            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let frame: ExecuteStageFrame = serde_json::from_slice(line).map_err(|e| {
                    PluginStatus::internal(format!("malformed stage frame: {}", e))
                })?;
                match frame {
                    ExecuteStageFrame::Event { event } => events.send(event).await,
                    ExecuteStageFrame::Completed { outcome } => return Ok(outcome),
                    ExecuteStageFrame::Error { status } => return Err(status),
                }
            }
        }
    }
}

#[async_trait]
impl LivestateService for RemotePlugin {
    async fn get_livestate(&self, req: GetLivestateRequest) -> PluginResult<GetLivestateResponse> {
        self.call(wire::GET_LIVESTATE, &req).await
    }
}
