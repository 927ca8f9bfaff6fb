//! Deployment controller
//!
//! Admits deployments handed over by the trigger and drives each one through
//! planning and execution. At most one deployment per application is active;
//! later ones wait in a per-application FIFO. A global semaphore bounds how
//! many run at once across applications.

use chrono::Utc;
use keel_client::{ControlPlane, Retry};
use keel_core::domain::deployment::{Deployment, DeploymentStatus, RollbackOutcome};
use keel_core::dto::application::{GetMostRecentDeployment, MostRecentKind};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};
use crate::executor::{CancelRequest, ControlHandle, ControlSignals, Executor, control_channel};
use crate::planner::PlannerCoordinator;
use crate::reporter::Reporter;
use crate::spec_source::{ResolvedSpec, SpecSource};

pub const RECOVERED_ROLLBACK_REASON: &str =
    "The agent restarted while rolling back; the rollback was not completed";

struct Active {
    deployment_id: String,
    handle: ControlHandle,
}

#[derive(Default)]
struct State {
    /// Running deployment per application
    active: HashMap<String, Active>,
    queued: HashMap<String, VecDeque<Deployment>>,
}

struct Inner {
    control_plane: Arc<dyn ControlPlane>,
    specs: Arc<SpecSource>,
    planner: PlannerCoordinator,
    executor: Executor,
    reporter: Reporter,
    permits: Arc<Semaphore>,
    state: Mutex<State>,
    completions: Option<mpsc::Sender<Deployment>>,
    retry: Retry,
    shutdown: CancellationToken,
}

/// Cheap to clone; every clone drives the same queues
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

pub struct ControllerBuilder {
    control_plane: Arc<dyn ControlPlane>,
    specs: Arc<SpecSource>,
    planner: PlannerCoordinator,
    executor: Executor,
    reporter: Reporter,
    max_parallel: usize,
    completions: Option<mpsc::Sender<Deployment>>,
    retry: Retry,
    shutdown: CancellationToken,
}

impl ControllerBuilder {
    pub fn max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    /// Every finished deployment is also sent here
    pub fn completions(mut self, tx: mpsc::Sender<Deployment>) -> Self {
        self.completions = Some(tx);
        self
    }

    pub fn retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Controller {
        Controller {
            inner: Arc::new(Inner {
                control_plane: self.control_plane,
                specs: self.specs,
                planner: self.planner,
                executor: self.executor,
                reporter: self.reporter,
                permits: Arc::new(Semaphore::new(self.max_parallel)),
                state: Mutex::new(State::default()),
                completions: self.completions,
                retry: self.retry,
                shutdown: self.shutdown,
            }),
        }
    }
}

impl Controller {
    pub fn builder(
        control_plane: Arc<dyn ControlPlane>,
        specs: Arc<SpecSource>,
        planner: PlannerCoordinator,
        executor: Executor,
        reporter: Reporter,
        shutdown: CancellationToken,
    ) -> ControllerBuilder {
        ControllerBuilder {
            control_plane,
            specs,
            planner,
            executor,
            reporter,
            max_parallel: 10,
            completions: None,
            retry: Retry::control_plane(),
            shutdown,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed deployments from the trigger until the sender closes or shutdown
    pub async fn run_intake(&self, mut rx: mpsc::Receiver<Deployment>) {
        info!("Starting deployment controller");
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(d) => self.submit(d),
                    None => break,
                },
            }
        }
        info!("Deployment controller stopped");
    }

    /// Queue a deployment; it starts once its application is idle
    pub fn submit(&self, deployment: Deployment) {
        if deployment.is_terminal() {
            debug!(deployment_id = %deployment.id, "Ignoring completed deployment");
            return;
        }
        let mut state = self.state();
        let app_id = deployment.application_id.clone();
        let already_known = state.active.get(&app_id).is_some_and(|a| a.deployment_id == deployment.id)
            || state
                .queued
                .get(&app_id)
                .is_some_and(|q| q.iter().any(|d| d.id == deployment.id));
        if already_known {
            return;
        }
        if state.active.contains_key(&app_id) {
            debug!(deployment_id = %deployment.id, application_id = %app_id, "Application busy, deployment queued");
            state.queued.entry(app_id).or_default().push_back(deployment);
            return;
        }
        self.start(&mut state, deployment);
    }

    fn start(&self, state: &mut State, deployment: Deployment) {
        let (handle, signals) = control_channel();
        state.active.insert(
            deployment.application_id.clone(),
            Active {
                deployment_id: deployment.id.clone(),
                handle,
            },
        );
        let controller = self.clone();
        tokio::spawn(async move { controller.work(deployment, signals).await });
    }

    /// Deployment IDs currently admitted, one per application
    pub fn active(&self) -> Vec<String> {
        self.state().active.values().map(|a| a.deployment_id.clone()).collect()
    }

    pub fn queued(&self, application_id: &str) -> usize {
        self.state().queued.get(application_id).map_or(0, VecDeque::len)
    }

    /// Cancel a deployment that is running or still waiting its turn
    pub async fn cancel(&self, deployment_id: &str, request: CancelRequest) -> Result<()> {
        let waiting = {
            let mut state = self.state();
            if let Some(active) = state.active.values().find(|a| a.deployment_id == deployment_id) {
                info!(deployment_id, commander = %request.commander, "Cancelling deployment");
                active.handle.cancel(request);
                return Ok(());
            }
            state.queued.values_mut().find_map(|q| {
                let pos = q.iter().position(|d| d.id == deployment_id)?;
                q.remove(pos)
            })
        };

        let Some(mut deployment) = waiting else {
            return Err(AgentError::NotFound(format!(
                "deployment {} is not in progress on this agent",
                deployment_id
            )));
        };
        let by = if request.commander.is_empty() {
            String::new()
        } else {
            format!(" by {}", request.commander)
        };
        deployment
            .transition(
                DeploymentStatus::Cancelled,
                format!("The deployment was cancelled{} before it started", by),
                Utc::now(),
            )
            .map_err(|e| AgentError::FailedPrecondition(e.to_string()))?;
        self.inner.reporter.status_changed(&deployment).await;
        self.completed(deployment).await;
        Ok(())
    }

    /// Resume deployments left unfinished by a previous run
    ///
    /// A rollback cannot be resumed safely, so ROLLING_BACK ends as FAILURE.
    pub async fn recover(&self, deployments: Vec<Deployment>) {
        let mut resumed = 0;
        for mut d in deployments {
            match d.status {
                DeploymentStatus::RollingBack => {
                    warn!(deployment_id = %d.id, "Found deployment interrupted while rolling back");
                    d.rollback = Some(RollbackOutcome::Interrupted);
                    if let Err(e) = d.transition(DeploymentStatus::Failure, RECOVERED_ROLLBACK_REASON, Utc::now()) {
                        error!("{}", e);
                        continue;
                    }
                    self.inner.reporter.status_changed(&d).await;
                }
                status if status.is_terminal() => {}
                _ => {
                    resumed += 1;
                    self.submit(d);
                }
            }
        }
        if resumed > 0 {
            info!("Resumed {} unfinished deployment(s)", resumed);
        }
    }

    async fn work(&self, deployment: Deployment, signals: ControlSignals) {
        let id = deployment.id.clone();
        let app_id = deployment.application_id.clone();

        let permit = tokio::select! {
            p = Arc::clone(&self.inner.permits).acquire_owned() => p.ok(),
            _ = self.inner.shutdown.cancelled() => None,
        };
        let finished = match permit {
            Some(_permit) => self.process(deployment, signals).await,
            None => deployment,
        };

        if self.inner.shutdown.is_cancelled() && !finished.is_terminal() {
            info!(deployment_id = %id, status = %finished.status, "Left unfinished for the next start");
            return;
        }
        self.completed(finished).await;

        let mut state = self.state();
        if state.active.get(&app_id).is_some_and(|a| a.deployment_id == id) {
            state.active.remove(&app_id);
        }
        let next = state.queued.get_mut(&app_id).and_then(VecDeque::pop_front);
        if state.queued.get(&app_id).is_some_and(VecDeque::is_empty) {
            state.queued.remove(&app_id);
        }
        if let Some(next) = next {
            self.start(&mut state, next);
        }
    }

    async fn completed(&self, deployment: Deployment) {
        if let Some(tx) = &self.inner.completions {
            let _ = tx.send(deployment).await;
        }
    }

    async fn process(&self, mut d: Deployment, signals: ControlSignals) -> Deployment {
        let resolved = match self.inner.specs.load_for(&d).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let reason = format!("Failed to load the application spec: {}", e);
                self.fail(&mut d, reason).await;
                return d;
            }
        };

        if d.running_commit_hash.is_empty() {
            d.running_commit_hash = self.running_commit(&d).await;
        }

        if d.status == DeploymentStatus::Pending {
            if signals.token().is_cancelled() {
                self.cancelled(&mut d, &signals, "before it was planned").await;
                return d;
            }
            match self.inner.planner.plan(&d, &resolved, signals.token()).await {
                Ok(plan) => {
                    if let Err(e) = plan.apply(&mut d, Utc::now()) {
                        error!("{}", e);
                        return d;
                    }
                    self.inner.reporter.planned(&d).await;
                }
                Err(e) if self.inner.shutdown.is_cancelled() => {
                    debug!(deployment_id = %d.id, "Planning abandoned on shutdown: {}", e);
                    return d;
                }
                Err(e) if signals.token().is_cancelled() => {
                    debug!(deployment_id = %d.id, "Planning stopped by cancel: {}", e);
                    self.cancelled(&mut d, &signals, "while it was being planned").await;
                    return d;
                }
                Err(e) => {
                    let reason = format!("Failed to plan the deployment: {}", e);
                    self.fail(&mut d, reason).await;
                    return d;
                }
            }
        }

        let changed = self.changed_files(&d, &resolved).await;
        self.inner.executor.run(d, resolved, changed, signals).await
    }

    async fn cancelled(&self, d: &mut Deployment, signals: &ControlSignals, when: &str) {
        let reason = signals.cancel_reason(when);
        info!(deployment_id = %d.id, "{}", reason);
        match d.transition(DeploymentStatus::Cancelled, reason, Utc::now()) {
            Ok(()) => self.inner.reporter.status_changed(d).await,
            Err(e) => error!("{}", e),
        }
    }

    async fn fail(&self, d: &mut Deployment, reason: String) {
        warn!(deployment_id = %d.id, "{}", reason);
        match d.transition(DeploymentStatus::Failure, reason, Utc::now()) {
            Ok(()) => self.inner.reporter.status_changed(d).await,
            Err(e) => error!("{}", e),
        }
    }

    /// Commit of the application's last successful deployment, if any
    async fn running_commit(&self, d: &Deployment) -> String {
        let cp = &self.inner.control_plane;
        let req = GetMostRecentDeployment {
            application_id: d.application_id.clone(),
            kind: MostRecentKind::Successful,
        };
        match self
            .inner
            .retry
            .run(&self.inner.shutdown, |_| cp.get_application_most_recent_deployment(req.clone()))
            .await
        {
            Ok(reference) => reference.map(|r| r.commit_hash).unwrap_or_default(),
            Err(e) => {
                warn!(deployment_id = %d.id, "Could not look up the running commit: {}", e);
                String::new()
            }
        }
    }

    /// Files changed since the running commit, used by skipOn options
    async fn changed_files(&self, d: &Deployment, resolved: &ResolvedSpec) -> Vec<String> {
        let needs_files = d.stages.iter().any(|s| !s.skip_on.paths.is_empty());
        if !needs_files || d.running_commit_hash.is_empty() {
            return Vec::new();
        }
        let repo = match self.inner.specs.repository(&d.git_path) {
            Ok(repo) => repo,
            Err(e) => {
                warn!(deployment_id = %d.id, "{}", e);
                return Vec::new();
            }
        };
        match self
            .inner
            .specs
            .git()
            .changed_files(repo, &d.running_commit_hash, &resolved.input.commit_hash)
            .await
        {
            Ok(files) => files,
            Err(e) => {
                warn!(deployment_id = %d.id, "Failed to list changed files: {}", e);
                Vec::new()
            }
        }
    }
}
