//! Pipeline stage configuration

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::SpecError;
use super::duration::{serde_duration, serde_opt_duration};

/// Stage name plugins use for manual approval gates
pub const WAIT_APPROVAL: &str = "WAIT_APPROVAL";

/// One stage of a user-defined pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default, with = "serde_opt_duration", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Forwarded verbatim to the owning plugin
    #[serde(default = "empty_object")]
    pub with: serde_json::Value,
    #[serde(default)]
    pub skip_on: SkipOptions,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl PipelineStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: String::new(),
            timeout: None,
            with: empty_object(),
            skip_on: SkipOptions::default(),
        }
    }

    /// The `with` payload as bytes; a null payload becomes `{}`
    pub fn config_bytes(&self) -> Vec<u8> {
        let value = if self.with.is_null() { empty_object() } else { self.with.clone() };
        serde_json::to_vec(&value).unwrap_or_else(|_| b"{}".to_vec())
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.trim().is_empty() {
            return Err(SpecError::invalid("pipeline stage name must not be empty"));
        }
        self.skip_on.validate()?;
        if self.name == WAIT_APPROVAL {
            let opts: WaitApprovalStageOptions = serde_json::from_value(self.with.clone())
                .map_err(|e| SpecError::invalid(format!("invalid WAIT_APPROVAL options: {}", e)))?;
            opts.validate()?;
        }
        Ok(())
    }
}

/// Conditions under which a stage is skipped
///
/// A stage is skipped when the commit message starts with one of the
/// prefixes, or when every changed file matches one of the path regexes.
/// Empty options never skip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commit_message_prefixes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

impl SkipOptions {
    pub fn is_empty(&self) -> bool {
        self.commit_message_prefixes.is_empty() && self.paths.is_empty()
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        for p in &self.paths {
            Regex::new(p).map_err(|e| SpecError::invalid(format!("invalid skipOn path {:?}: {}", p, e)))?;
        }
        Ok(())
    }

    /// Whether a stage carrying these options should be skipped
    pub fn should_skip(&self, commit_message: &str, changed_files: &[String]) -> Result<bool, SpecError> {
        if self
            .commit_message_prefixes
            .iter()
            .any(|p| !p.is_empty() && commit_message.starts_with(p.as_str()))
        {
            return Ok(true);
        }
        if self.paths.is_empty() || changed_files.is_empty() {
            return Ok(false);
        }
        let regexes = self
            .paths
            .iter()
            .map(|p| Regex::new(p).map_err(|e| SpecError::invalid(format!("invalid skipOn path {:?}: {}", p, e))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(changed_files
            .iter()
            .all(|f| regexes.iter().any(|r| r.is_match(f))))
    }
}

/// Options of a `WAIT_APPROVAL` stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitApprovalStageOptions {
    #[serde(default = "default_approval_timeout", with = "serde_duration")]
    pub timeout: Duration,
    /// User IDs allowed to approve; empty means anyone
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default = "default_min_approver_num")]
    pub min_approver_num: u32,
}

fn default_approval_timeout() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_min_approver_num() -> u32 {
    1
}

impl Default for WaitApprovalStageOptions {
    fn default() -> Self {
        Self {
            timeout: default_approval_timeout(),
            approvers: Vec::new(),
            min_approver_num: default_min_approver_num(),
        }
    }
}

impl WaitApprovalStageOptions {
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.min_approver_num < 1 {
            return Err(SpecError::invalid(
                "minApproverNum must be greater than or equal to 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_skip_options_never_skip() {
        let opts = SkipOptions::default();
        let files = vec!["docs/a.md".to_string()];
        assert!(!opts.should_skip("[skip ci] docs", &files).unwrap());
    }

    #[test]
    fn test_skip_on_commit_prefix() {
        let opts = SkipOptions {
            commit_message_prefixes: vec!["[skip canary]".into()],
            paths: vec![],
        };
        assert!(opts.should_skip("[skip canary] hotfix", &[]).unwrap());
        assert!(!opts.should_skip("hotfix [skip canary]", &[]).unwrap());
        assert!(!opts.should_skip("[SKIP CANARY] hotfix", &[]).unwrap());
    }

    #[test]
    fn test_skip_on_paths_requires_every_file_to_match() {
        let opts = SkipOptions {
            commit_message_prefixes: vec![],
            paths: vec!["^docs/.*".into()],
        };
        let docs_only = vec!["docs/a.md".to_string(), "docs/b.md".to_string()];
        let mixed = vec!["docs/a.md".to_string(), "deploy.yaml".to_string()];
        assert!(opts.should_skip("msg", &docs_only).unwrap());
        assert!(!opts.should_skip("msg", &mixed).unwrap());
        assert!(!opts.should_skip("msg", &[]).unwrap());
    }

    #[test]
    fn test_wait_approval_defaults_and_validation() {
        let opts: WaitApprovalStageOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.min_approver_num, 1);
        assert_eq!(opts.timeout, Duration::from_secs(6 * 3600));

        let opts: WaitApprovalStageOptions =
            serde_json::from_str(r#"{"minApproverNum":0}"#).unwrap();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_wait_approval_stage_validated_by_name() {
        let mut stage = PipelineStage::new(WAIT_APPROVAL);
        stage.with = serde_json::json!({"minApproverNum": 0, "timeout": "1h"});
        assert!(stage.validate().is_err());

        stage.with = serde_json::json!({"minApproverNum": 2, "timeout": "1h"});
        assert!(stage.validate().is_ok());
    }
}
