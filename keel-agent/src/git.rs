//! Git provider
//!
//! The trigger only needs three things from Git: the head of a branch, the
//! files changed between two commits and the content of a file at a commit.
//! [`GitCli`] shells out to the `git` binary against the local clones listed
//! in the configuration.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::RepositoryConfig;
use crate::error::{AgentError, Result};

/// Upper bound for network operations against the remote
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommit {
    pub hash: String,
    pub author: String,
    /// Unix seconds
    pub timestamp: i64,
    pub message: String,
}

#[async_trait]
pub trait GitClient: Send + Sync {
    /// Fetch the remote and return the head of the configured branch
    async fn head(&self, repo: &RepositoryConfig) -> Result<GitCommit>;

    /// Repository-relative paths changed between two commits
    async fn changed_files(&self, repo: &RepositoryConfig, from: &str, to: &str) -> Result<Vec<String>>;

    /// File content at a commit; `None` if the file does not exist there
    async fn read_file(&self, repo: &RepositoryConfig, commit: &str, path: &str) -> Result<Option<Vec<u8>>>;
}

/// [`GitClient`] backed by the `git` command line
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
    fetch_timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            fetch_timeout: FETCH_TIMEOUT,
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    async fn run(&self, dir: Option<&Path>, args: &[&str], timeout: Duration) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.binary);
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let verb = args.first().copied().unwrap_or_default();
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| AgentError::Git(format!("git {} timed out after {:?}", verb, timeout)))?
            .map_err(|e| AgentError::Git(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(AgentError::Git(format!(
                "git {} failed: {}",
                verb,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn ensure_clone(&self, repo: &RepositoryConfig) -> Result<()> {
        if repo.path.join(".git").exists() {
            return Ok(());
        }
        info!(repo = %repo.id, path = %repo.path.display(), "Cloning repository");
        let path = repo.path.to_string_lossy();
        self.run(
            None,
            &["clone", "--branch", &repo.branch, &repo.remote, &path],
            self.fetch_timeout,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GitClient for GitCli {
    async fn head(&self, repo: &RepositoryConfig) -> Result<GitCommit> {
        self.ensure_clone(repo).await?;
        debug!(repo = %repo.id, branch = %repo.branch, "Fetching");
        self.run(
            Some(&repo.path),
            &["fetch", "--quiet", "origin", &repo.branch],
            self.fetch_timeout,
        )
        .await?;

        let rev = format!("origin/{}", repo.branch);
        let out = self
            .run(
                Some(&repo.path),
                &["log", "-1", "--format=%H%x1f%an%x1f%ct%x1f%B", &rev],
                LOCAL_TIMEOUT,
            )
            .await?;
        parse_log_record(&String::from_utf8_lossy(&out))
    }

    async fn changed_files(&self, repo: &RepositoryConfig, from: &str, to: &str) -> Result<Vec<String>> {
        let out = self
            .run(Some(&repo.path), &["diff", "--name-only", from, to], LOCAL_TIMEOUT)
            .await?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn read_file(&self, repo: &RepositoryConfig, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let object = format!("{}:{}", commit, path);
        match self.run(Some(&repo.path), &["show", &object], LOCAL_TIMEOUT).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(AgentError::Git(msg)) if msg.contains("does not exist") || msg.contains("exists on disk, but not in") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Parse `%H%x1f%an%x1f%ct%x1f%B`
fn parse_log_record(out: &str) -> Result<GitCommit> {
    let mut parts = out.splitn(4, '\u{1f}');
    let (Some(hash), Some(author), Some(ts), Some(message)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AgentError::Git(format!("unexpected git log output: {:?}", out)));
    };
    let timestamp = ts
        .trim()
        .parse()
        .map_err(|_| AgentError::Git(format!("bad commit timestamp {:?}", ts)))?;
    Ok(GitCommit {
        hash: hash.trim().to_string(),
        author: author.to_string(),
        timestamp,
        message: message.trim_end().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_record() {
        let out = "abc123\u{1f}Jane Dev\u{1f}1700000000\u{1f}Bump image\n\nPipecd-Trace-Commit-Hash: fff\n";
        let commit = parse_log_record(out).unwrap();
        assert_eq!(commit.hash, "abc123");
        assert_eq!(commit.author, "Jane Dev");
        assert_eq!(commit.timestamp, 1_700_000_000);
        assert_eq!(commit.message, "Bump image\n\nPipecd-Trace-Commit-Hash: fff");
    }

    #[test]
    fn test_parse_log_record_garbage() {
        assert!(parse_log_record("nope").is_err());
        assert!(parse_log_record("a\u{1f}b\u{1f}soon\u{1f}msg").is_err());
    }
}
