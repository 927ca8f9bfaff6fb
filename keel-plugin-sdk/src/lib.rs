//! Keel plugin SDK
//!
//! Everything a deploy plugin needs to talk to the agent:
//! - [`serve`] exposes any [`Plugin`] over the loopback transport, performing
//!   the stdout handshake and checking the shared secret
//! - [`AgentCallbackClient`] reads stage commands (approvals) back from the agent
//! - [`wait_approval`] implements a `WAIT_APPROVAL` stage on top of it
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use keel_core::plugin::*;
//! use keel_plugin_sdk::serve;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Noop;
//!
//! #[async_trait]
//! impl DeploymentService for Noop {
//!     async fn fetch_defined_stages(&self) -> PluginResult<FetchDefinedStagesResponse> {
//!         Ok(FetchDefinedStagesResponse { stages: vec!["NOOP_SYNC".into()] })
//!     }
//!     async fn determine_versions(&self, _: DetermineVersionsRequest) -> PluginResult<DetermineVersionsResponse> {
//!         Ok(Default::default())
//!     }
//!     async fn determine_strategy(&self, _: DetermineStrategyRequest) -> PluginResult<DetermineStrategyResponse> {
//!         Ok(Default::default())
//!     }
//!     async fn build_pipeline_sync_stages(&self, _: BuildPipelineSyncStagesRequest) -> PluginResult<BuildStagesResponse> {
//!         Ok(Default::default())
//!     }
//!     async fn build_quick_sync_stages(&self, _: BuildQuickSyncStagesRequest) -> PluginResult<BuildStagesResponse> {
//!         Ok(BuildStagesResponse { stages: vec![PlannedStage {
//!             index: 0, name: "NOOP_SYNC".into(), desc: String::new(), rollback: false, config: Default::default(),
//!         }] })
//!     }
//!     async fn execute_stage(&self, _: ExecuteStageRequest, events: StageEventSender, _: CancellationToken) -> PluginResult<StageOutcome> {
//!         events.info("nothing to do").await;
//!         Ok(StageOutcome::success())
//!     }
//! }
//!
//! impl LivestateService for Noop {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel_plugin_sdk::SdkError> {
//!     keel_plugin_sdk::init_tracing();
//!     serve(Noop).await
//! }
//! ```

pub mod approval;
pub mod callback;
pub mod error;
pub mod server;

pub use approval::wait_approval;
pub use callback::AgentCallbackClient;
pub use error::SdkError;
pub use keel_core::plugin::Plugin;
pub use server::{PluginEnv, router, serve, serve_on};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise tracing for a plugin process
///
/// Logs go to stderr; stdout is reserved for the handshake line.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
