//! Loads application specs from Git at a given commit

use keel_core::domain::application::{Application, GitPath};
use keel_core::domain::deployment::Deployment;
use keel_core::plugin::ApplicationInput;
use keel_core::spec::{ApplicationSpec, SpecError, parse_application_spec};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RepositoryConfig;
use crate::error::{AgentError, Result};
use crate::git::GitClient;

/// An application spec plus the bundle plugins receive for it
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
    pub kind: String,
    pub spec: ApplicationSpec,
    pub input: ApplicationInput,
}

pub struct SpecSource {
    git: Arc<dyn GitClient>,
    repos: HashMap<String, RepositoryConfig>,
}

impl SpecSource {
    pub fn new(git: Arc<dyn GitClient>, repos: &[RepositoryConfig]) -> Self {
        Self {
            git,
            repos: repos.iter().map(|r| (r.id.clone(), r.clone())).collect(),
        }
    }

    pub fn git(&self) -> &Arc<dyn GitClient> {
        &self.git
    }

    pub fn repository(&self, git_path: &GitPath) -> Result<&RepositoryConfig> {
        self.repos.get(&git_path.repo.id).ok_or_else(|| {
            AgentError::NotFound(format!("repository {} is not configured", git_path.repo.id))
        })
    }

    pub fn repositories(&self) -> impl Iterator<Item = &RepositoryConfig> {
        self.repos.values()
    }

    pub async fn load(&self, app: &Application, commit: &str) -> Result<ResolvedSpec> {
        self.load_path(&app.id, &app.name, &app.git_path, commit).await
    }

    /// Spec a deployment was triggered with
    pub async fn load_for(&self, deployment: &Deployment) -> Result<ResolvedSpec> {
        self.load_path(
            &deployment.application_id,
            &deployment.application_name,
            &deployment.git_path,
            &deployment.trigger.commit.hash,
        )
        .await
    }

    async fn load_path(
        &self,
        application_id: &str,
        application_name: &str,
        git_path: &GitPath,
        commit: &str,
    ) -> Result<ResolvedSpec> {
        let repo = self.repository(git_path)?;
        let path = git_path.spec_path();
        let raw = self
            .git
            .read_file(repo, commit, &path)
            .await?
            .ok_or_else(|| SpecError::NotFound(path.clone()))?;

        let loaded = parse_application_spec(&raw, git_path.spec_filename())?;
        Ok(ResolvedSpec {
            kind: loaded.kind,
            spec: loaded.spec,
            input: ApplicationInput {
                application_id: application_id.to_string(),
                application_name: application_name.to_string(),
                spec_yaml: loaded.raw,
                spec_filename: loaded.filename,
                commit_hash: commit.to_string(),
                app_dir: git_path.app_dir().to_string(),
                repo_dir: repo.path.to_string_lossy().into_owned(),
            },
        })
    }
}
