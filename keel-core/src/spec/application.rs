//! Application spec model

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::SpecError;
use super::duration::serde_duration;
use super::notification::DeploymentNotification;
use super::stage::PipelineStage;
use crate::domain::application::Application;

/// The `spec` block of an application spec file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub description: String,
    pub planner: DeploymentPlanner,
    pub commit_matcher: CommitMatcher,
    pub pipeline: Option<DeploymentPipeline>,
    pub trigger: Trigger,
    pub post_sync: Option<PostSync>,
    #[serde(with = "serde_duration")]
    pub timeout: Duration,
    pub encryption: Option<SecretEncryption>,
    pub attachment: Option<Attachment>,
    pub notification: Option<DeploymentNotification>,
    pub drift_detection: Option<DriftDetection>,
    /// Plugin-specific blocks, passed through untouched
    pub plugins: BTreeMap<String, serde_json::Value>,
}

impl Default for ApplicationSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            labels: BTreeMap::new(),
            description: String::new(),
            planner: DeploymentPlanner::default(),
            commit_matcher: CommitMatcher::default(),
            pipeline: None,
            trigger: Trigger::default(),
            post_sync: None,
            timeout: Duration::from_secs(6 * 3600),
            encryption: None,
            attachment: None,
            notification: None,
            drift_detection: None,
            plugins: BTreeMap::new(),
        }
    }
}

impl ApplicationSpec {
    /// Pipeline stages, empty when no pipeline is configured
    pub fn stages(&self) -> &[PipelineStage] {
        self.pipeline
            .as_ref()
            .map(|p| p.stages.as_slice())
            .unwrap_or_default()
    }

    pub fn has_pipeline(&self) -> bool {
        !self.stages().is_empty()
    }

    /// Chain matchers when `postSync.chain` is configured
    pub fn chain_matchers(&self) -> Option<&[ChainApplicationMatcher]> {
        self.post_sync
            .as_ref()
            .and_then(|p| p.chain.as_ref())
            .map(|c| c.applications.as_slice())
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.timeout.is_zero() {
            return Err(SpecError::invalid("timeout must be positive"));
        }
        self.commit_matcher.validate()?;
        self.trigger.validate()?;
        for stage in self.stages() {
            stage.validate()?;
        }
        if let Some(post_sync) = &self.post_sync {
            post_sync.validate()?;
        }
        if let Some(encryption) = &self.encryption {
            encryption.validate()?;
        }
        if let Some(attachment) = &self.attachment {
            attachment.validate()?;
        }
        if let Some(notification) = &self.notification {
            notification.validate()?;
        }
        if let Some(drift) = &self.drift_detection {
            drift.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentPlanner {
    /// Always use the pipeline for commit-triggered deployments
    pub always_use_pipeline: bool,
    pub auto_rollback: bool,
}

impl Default for DeploymentPlanner {
    fn default() -> Self {
        Self {
            always_use_pipeline: false,
            auto_rollback: true,
        }
    }
}

/// Regexes over the commit message that force a strategy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommitMatcher {
    pub quick_sync: String,
    pub pipeline: String,
}

impl CommitMatcher {
    fn compile(pattern: &str) -> Result<Option<Regex>, SpecError> {
        if pattern.is_empty() {
            return Ok(None);
        }
        Regex::new(pattern)
            .map(Some)
            .map_err(|e| SpecError::invalid(format!("invalid commitMatcher regex {:?}: {}", pattern, e)))
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        Self::compile(&self.quick_sync)?;
        Self::compile(&self.pipeline)?;
        Ok(())
    }

    pub fn matches_quick_sync(&self, message: &str) -> Result<bool, SpecError> {
        Ok(Self::compile(&self.quick_sync)?.is_some_and(|r| r.is_match(message)))
    }

    pub fn matches_pipeline(&self, message: &str) -> Result<bool, SpecError> {
        Ok(Self::compile(&self.pipeline)?.is_some_and(|r| r.is_match(message)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPipeline {
    #[serde(default)]
    pub stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Trigger {
    pub on_commit: OnCommit,
    pub on_command: OnCommand,
    pub on_out_of_sync: OnOutOfSync,
    pub on_chain: OnChain,
}

impl Trigger {
    pub fn validate(&self) -> Result<(), SpecError> {
        self.on_commit.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnCommit {
    pub disabled: bool,
    /// Regexes a changed file must match; empty matches everything
    pub paths: Vec<String>,
    /// Regexes of changed files that never trigger on their own
    pub ignores: Vec<String>,
}

impl OnCommit {
    pub fn validate(&self) -> Result<(), SpecError> {
        self.compiled_paths()?;
        self.compiled_ignores()?;
        Ok(())
    }

    pub fn compiled_paths(&self) -> Result<Vec<Regex>, SpecError> {
        compile_all("trigger.onCommit.paths", &self.paths)
    }

    pub fn compiled_ignores(&self) -> Result<Vec<Regex>, SpecError> {
        compile_all("trigger.onCommit.ignores", &self.ignores)
    }
}

fn compile_all(field: &str, patterns: &[String]) -> Result<Vec<Regex>, SpecError> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| SpecError::invalid(format!("invalid {} regex {:?}: {}", field, p, e))))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnCommand {
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnOutOfSync {
    pub disabled: bool,
    /// Minimum time since the last deployment before a new one may start
    #[serde(with = "serde_duration")]
    pub min_window: Duration,
}

impl Default for OnOutOfSync {
    fn default() -> Self {
        Self {
            disabled: true,
            min_window: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnChain {
    pub disabled: bool,
}

impl Default for OnChain {
    fn default() -> Self {
        Self { disabled: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostSync {
    #[serde(default)]
    pub chain: Option<DeploymentChainSpec>,
}

impl PostSync {
    pub fn validate(&self) -> Result<(), SpecError> {
        match &self.chain {
            Some(chain) => chain.validate(),
            None => Ok(()),
        }
    }
}

/// Applications to deploy after this one succeeds, one block per matcher
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentChainSpec {
    #[serde(default)]
    pub applications: Vec<ChainApplicationMatcher>,
}

impl DeploymentChainSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.applications.is_empty() {
            return Err(SpecError::invalid(
                "missing specified applications that will be triggered on this chain of deployment",
            ));
        }
        self.applications
            .iter()
            .try_for_each(ChainApplicationMatcher::validate)
    }
}

/// Selects applications by name, kind and labels; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainApplicationMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ChainApplicationMatcher {
    pub fn validate(&self) -> Result<(), SpecError> {
        let has_name = self.name.as_deref().is_some_and(|n| !n.is_empty());
        let has_kind = self.kind.as_deref().is_some_and(|k| !k.is_empty());
        if !has_name && !has_kind && self.labels.is_empty() {
            return Err(SpecError::invalid(
                "at least one of \"name\", \"kind\" or \"labels\" must be set to find applications to deploy",
            ));
        }
        Ok(())
    }

    pub fn matches(&self, app: &Application) -> bool {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            if app.name != name {
                return false;
            }
        }
        if let Some(kind) = self.kind.as_deref().filter(|k| !k.is_empty()) {
            if !app.kind.eq_ignore_ascii_case(kind) {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| app.labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretEncryption {
    pub encrypted_secrets: BTreeMap<String, String>,
    pub decryption_targets: Vec<String>,
}

impl SecretEncryption {
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.decryption_targets.iter().all(|t| t.is_empty()) {
            return Err(SpecError::invalid("decryptionTargets must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attachment {
    pub sources: BTreeMap<String, String>,
    pub targets: Vec<String>,
}

impl Attachment {
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.targets.iter().all(|t| t.is_empty()) {
            return Err(SpecError::invalid("attachment targets must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriftDetection {
    /// Entries of the form `apiVersion:kind:namespace:name#fieldPath`
    pub ignore_fields: Vec<String>,
}

impl DriftDetection {
    pub fn validate(&self) -> Result<(), SpecError> {
        for field in &self.ignore_fields {
            if field.split('#').count() != 2 {
                return Err(SpecError::invalid(
                    "ignoreFields must be in the form of 'apiVersion:kind:namespace:name#fieldPath'",
                ));
            }
        }
        Ok(())
    }
}
