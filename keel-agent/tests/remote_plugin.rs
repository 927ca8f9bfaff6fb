//! The agent's HTTP plugin client against a plugin served by the SDK.

mod common;

use common::fixtures::{Behavior, CANARY_SPEC, KUBE_STAGES, KubePlugin};
use keel_agent::plugin::RemotePlugin;
use keel_core::Code;
use keel_core::domain::deployment::SyncStrategy;
use keel_core::domain::stage::StageStatus;
use keel_core::plugin::{
    ApplicationInput, DeploymentService, DetermineStrategyRequest, ExecuteStageRequest,
    GetLivestateRequest, LivestateService, Plugin, StageEvent, StageEventSender,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "s3cret";

struct Served {
    addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl Served {
    async fn start(plugin: KubePlugin) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let plugin: Arc<dyn Plugin> = Arc::new(plugin);
        let server = tokio::spawn(async move {
            keel_plugin_sdk::serve_on(listener, plugin, SECRET, token).await.unwrap();
        });
        Self { addr, shutdown, server }
    }

    fn client(&self) -> RemotePlugin {
        RemotePlugin::new("kube", self.addr, SECRET)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server).await;
    }
}

fn input(spec: &str) -> ApplicationInput {
    ApplicationInput {
        application_id: "a1".into(),
        application_name: "api".into(),
        spec_yaml: spec.into(),
        spec_filename: "app.pipecd.yaml".into(),
        commit_hash: "c1".into(),
        app_dir: "apps/api".into(),
        repo_dir: String::new(),
    }
}

fn execute(stage: &str) -> ExecuteStageRequest {
    ExecuteStageRequest {
        execution_id: format!("exec-{}", stage),
        deployment_id: "d1".into(),
        stage_id: "stage-0".into(),
        stage_name: stage.into(),
        stage_index: 0,
        rollback: false,
        config: Default::default(),
        input: input(CANARY_SPEC),
        deploy_targets: vec!["cluster-1".into()],
        timeout_secs: 60,
        running_commit_hash: String::new(),
    }
}

#[tokio::test]
async fn fetches_defined_stages() {
    let served = Served::start(KubePlugin::new()).await;
    let stages = served.client().fetch_defined_stages().await.unwrap().stages;
    assert_eq!(stages, KUBE_STAGES.map(String::from).to_vec());
    served.stop().await;
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let served = Served::start(KubePlugin::new()).await;
    let plugin = RemotePlugin::new("kube", served.addr, "not-the-secret");
    let err = plugin.fetch_defined_stages().await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    served.stop().await;
}

#[tokio::test]
async fn strategy_comes_from_the_plugin() {
    let served = Served::start(KubePlugin::new()).await;
    let resp = served
        .client()
        .determine_strategy(DetermineStrategyRequest {
            deployment_id: "d1".into(),
            input: input(CANARY_SPEC),
            deploy_targets: vec!["cluster-1".into()],
            running_commit_hash: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(resp.strategy, Some(SyncStrategy::PipelineSync));
    served.stop().await;
}

#[tokio::test]
async fn execute_streams_events_then_outcome() {
    let served = Served::start(
        KubePlugin::new().on("K8S_PRIMARY_ROLLOUT", Behavior::Fail("ImagePullBackOff".into())),
    )
    .await;
    let client = served.client();

    let (events, mut rx) = StageEventSender::channel(16);
    let outcome = client
        .execute_stage(execute("K8S_SYNC"), events, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.status, StageStatus::Success);
    let mut messages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let StageEvent::Log(entry) = event {
            messages.push(entry.message);
        }
    }
    assert_eq!(messages, vec!["Running K8S_SYNC".to_string()]);

    let (events, _rx) = StageEventSender::channel(16);
    let outcome = client
        .execute_stage(execute("K8S_PRIMARY_ROLLOUT"), events, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.status, StageStatus::Failure);
    assert_eq!(outcome.reason, "ImagePullBackOff");

    served.stop().await;
}

#[tokio::test]
async fn cancel_reaches_the_plugin() {
    let served = Served::start(KubePlugin::new().on(
        "K8S_SYNC",
        Behavior::UntilCancelled {
            ack_after: Duration::from_millis(10),
        },
    ))
    .await;
    let client = served.client();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let (events, _rx) = StageEventSender::channel(16);
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        client.execute_stage(execute("K8S_SYNC"), events, cancel),
    )
    .await
    .expect("plugin did not acknowledge the cancel")
    .unwrap();
    assert_eq!(outcome.status, StageStatus::Cancelled);

    served.stop().await;
}

#[tokio::test]
async fn livestate_is_optional() {
    let served = Served::start(KubePlugin::new()).await;
    let err = served
        .client()
        .get_livestate(GetLivestateRequest {
            piped_id: "piped-1".into(),
            application_id: "a1".into(),
            deploy_targets: vec!["cluster-1".into()],
            input: input(CANARY_SPEC),
            ignore_fields: Vec::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unimplemented);
    served.stop().await;
}
