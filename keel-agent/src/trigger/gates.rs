//! Side-effect free checks deciding whether and how to trigger

use chrono::{DateTime, Utc};
use keel_core::domain::application::{DeploymentReference, GitPath};
use keel_core::domain::deployment::SyncStrategy;
use keel_core::spec::{ApplicationSpec, OnCommit, SpecError};
use std::time::Duration;

/// Whether a change set should trigger the application
///
/// Files matched by an ignore pattern are dropped first. Of the rest, at
/// least one must sit under the application directory and match one of
/// the path patterns; no patterns matches everything.
pub fn touches_application(
    git_path: &GitPath,
    on_commit: &OnCommit,
    changed_files: &[String],
) -> Result<bool, SpecError> {
    let ignores = on_commit.compiled_ignores()?;
    let paths = on_commit.compiled_paths()?;

    Ok(changed_files
        .iter()
        .filter(|f| !ignores.iter().any(|r| r.is_match(f)))
        .any(|f| git_path.contains(f) && (paths.is_empty() || paths.iter().any(|r| r.is_match(f)))))
}

/// Strategy for a commit-originated deployment plus its summary
pub fn commit_strategy(
    spec: &ApplicationSpec,
    commit_message: &str,
) -> Result<(SyncStrategy, String), SpecError> {
    let matcher = &spec.commit_matcher;
    if matcher.matches_quick_sync(commit_message)? {
        return Ok((
            SyncStrategy::QuickSync,
            format!("Quick sync because the commit message matches {:?}", matcher.quick_sync),
        ));
    }
    if matcher.matches_pipeline(commit_message)? {
        return Ok((
            SyncStrategy::PipelineSync,
            format!("Sync with pipeline because the commit message matches {:?}", matcher.pipeline),
        ));
    }
    if spec.planner.always_use_pipeline {
        return Ok((
            SyncStrategy::PipelineSync,
            "Sync with the specified pipeline (alwaysUsePipeline was set)".to_string(),
        ));
    }
    Ok((SyncStrategy::Auto, String::new()))
}

/// Whether enough time passed since the last deployment to resync
pub fn out_of_sync_window_passed(
    most_recent: Option<&DeploymentReference>,
    min_window: Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(last) = most_recent else {
        return true;
    };
    if !last.status.is_terminal() {
        return false;
    }
    match last.completed_at {
        Some(at) => chrono::Duration::from_std(min_window)
            .map(|w| at + w <= now)
            .unwrap_or(false),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::domain::application::GitRepository;
    use keel_core::domain::deployment::DeploymentStatus;
    use keel_core::spec::CommitMatcher;

    fn git_path(dir: &str) -> GitPath {
        GitPath {
            repo: GitRepository {
                id: "repo".into(),
                remote: "https://github.com/org/repo.git".into(),
                branch: "main".into(),
            },
            path: dir.into(),
            config_filename: None,
        }
    }

    fn files(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ignored_files_never_trigger() {
        let on_commit = OnCommit {
            ignores: vec!["^docs/.*".into()],
            ..Default::default()
        };
        let root = git_path(".");
        assert!(!touches_application(&root, &on_commit, &files(&["docs/README.md"])).unwrap());
        assert!(
            touches_application(&root, &on_commit, &files(&["docs/README.md", "manifests/deploy.yaml"]))
                .unwrap()
        );
    }

    #[test]
    fn test_files_must_be_under_app_dir() {
        let on_commit = OnCommit::default();
        let app = git_path("apps/web");
        assert!(!touches_application(&app, &on_commit, &files(&["apps/api/main.go"])).unwrap());
        assert!(!touches_application(&app, &on_commit, &files(&["apps/webhook/x.yaml"])).unwrap());
        assert!(touches_application(&app, &on_commit, &files(&["apps/web/deploy.yaml"])).unwrap());
        assert!(!touches_application(&app, &on_commit, &[]).unwrap());
    }

    #[test]
    fn test_paths_and_dir_apply_to_the_same_file() {
        let on_commit = OnCommit {
            paths: vec![r"\.yaml$".into()],
            ..Default::default()
        };
        let app = git_path("apps/web");
        // one file is a yaml elsewhere, the other is under the dir but not yaml
        assert!(
            !touches_application(&app, &on_commit, &files(&["other/x.yaml", "apps/web/main.go"])).unwrap()
        );
        assert!(touches_application(&app, &on_commit, &files(&["apps/web/app.yaml"])).unwrap());
    }

    #[test]
    fn test_commit_strategy_precedence() {
        let mut spec = ApplicationSpec {
            commit_matcher: CommitMatcher {
                quick_sync: "^hotfix".into(),
                pipeline: "^release".into(),
            },
            ..Default::default()
        };
        assert_eq!(commit_strategy(&spec, "hotfix: x").unwrap().0, SyncStrategy::QuickSync);
        assert_eq!(commit_strategy(&spec, "release: x").unwrap().0, SyncStrategy::PipelineSync);
        assert_eq!(commit_strategy(&spec, "chore").unwrap().0, SyncStrategy::Auto);

        spec.planner.always_use_pipeline = true;
        assert_eq!(commit_strategy(&spec, "chore").unwrap().0, SyncStrategy::PipelineSync);
        assert_eq!(commit_strategy(&spec, "hotfix: x").unwrap().0, SyncStrategy::QuickSync);
    }

    #[test]
    fn test_out_of_sync_window() {
        let now = Utc::now();
        let window = Duration::from_secs(300);
        let mut last = DeploymentReference {
            deployment_id: "d1".into(),
            status: DeploymentStatus::Success,
            summary: String::new(),
            commit_hash: "c1".into(),
            completed_at: Some(now - chrono::Duration::minutes(2)),
        };
        assert!(!out_of_sync_window_passed(Some(&last), window, now));

        last.completed_at = Some(now - chrono::Duration::minutes(6));
        assert!(out_of_sync_window_passed(Some(&last), window, now));

        last.status = DeploymentStatus::Running;
        assert!(!out_of_sync_window_passed(Some(&last), window, now));
        assert!(out_of_sync_window_passed(None, window, now));
    }
}
