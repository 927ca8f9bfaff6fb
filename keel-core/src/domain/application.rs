//! Application domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default name of the spec file inside an application directory
pub const DEFAULT_SPEC_FILENAME: &str = "app.pipecd.yaml";

/// An application registered with the control plane and bound to this agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub piped_id: String,
    /// Application kind as registered (e.g. "KUBERNETES"); used by chain matchers
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub git_path: GitPath,
    /// Plugin name to ordered list of deploy-target names
    #[serde(default)]
    pub deploy_targets_by_plugin: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub most_recent_successful_deployment: Option<DeploymentReference>,
    #[serde(default)]
    pub most_recent_deployment: Option<DeploymentReference>,
}

impl Application {
    /// Plugins this application deploys through, in name order
    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.deploy_targets_by_plugin.keys().map(String::as_str)
    }

    pub fn deploy_targets(&self, plugin: &str) -> &[String] {
        self.deploy_targets_by_plugin
            .get(plugin)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Location of an application inside a Git repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitPath {
    pub repo: GitRepository,
    /// Directory relative to the repository root; "" or "." is the root
    pub path: String,
    #[serde(default)]
    pub config_filename: Option<String>,
}

impl GitPath {
    pub fn spec_filename(&self) -> &str {
        self.config_filename
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_SPEC_FILENAME)
    }

    /// Application directory normalised without leading "./" or trailing "/"
    pub fn app_dir(&self) -> &str {
        let p = self.path.trim_start_matches("./").trim_end_matches('/');
        if p == "." { "" } else { p }
    }

    /// Repository-relative path of the spec file
    pub fn spec_path(&self) -> String {
        match self.app_dir() {
            "" => self.spec_filename().to_string(),
            dir => format!("{}/{}", dir, self.spec_filename()),
        }
    }

    /// Whether a repository-relative file path lies under the application directory
    pub fn contains(&self, file: &str) -> bool {
        match self.app_dir() {
            "" => true,
            dir => file
                .strip_prefix(dir)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRepository {
    pub id: String,
    pub remote: String,
    pub branch: String,
}

/// Lightweight pointer to a deployment, stored on the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentReference {
    pub deployment_id: String,
    pub status: super::deployment::DeploymentStatus,
    pub summary: String,
    pub commit_hash: String,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_path(path: &str) -> GitPath {
        GitPath {
            repo: GitRepository {
                id: "repo".into(),
                remote: "https://github.com/org/repo.git".into(),
                branch: "main".into(),
            },
            path: path.into(),
            config_filename: None,
        }
    }

    #[test]
    fn test_spec_path_uses_default_filename() {
        assert_eq!(git_path("apps/web").spec_path(), "apps/web/app.pipecd.yaml");
        assert_eq!(git_path(".").spec_path(), "app.pipecd.yaml");
        assert_eq!(git_path("").spec_path(), "app.pipecd.yaml");

        let mut custom = git_path("apps/web/");
        custom.config_filename = Some("web.pipecd.yaml".into());
        assert_eq!(custom.spec_path(), "apps/web/web.pipecd.yaml");
    }

    #[test]
    fn test_contains_respects_directory_boundaries() {
        let gp = git_path("apps/web");
        assert!(gp.contains("apps/web/deploy.yaml"));
        assert!(gp.contains("apps/web/k8s/svc.yaml"));
        assert!(!gp.contains("apps/webhook/deploy.yaml"));
        assert!(!gp.contains("docs/README.md"));

        assert!(git_path(".").contains("anything/at/all"));
    }
}
