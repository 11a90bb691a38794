//! Source repository collaborator
//!
//! Fetches exact commits as tar bundles and reports new commits on a branch.
//! The git implementation keeps a bare mirror of the remote under the
//! workspace and shells out to `git`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use shipway_core::domain::run::CommitRef;
use shipway_core::error::SourceError;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::command::{self, CommandOutput};

/// Fetches the contents of an exact commit
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Returns the commit's tree as a tar bundle
    async fn fetch(&self, commit: &CommitRef) -> Result<Bytes, SourceError>;
}

/// Reports commits that appeared on a branch since the last poll
#[async_trait]
pub trait CommitWatcher: Send {
    /// New commits, oldest first
    async fn poll(&mut self) -> Result<Vec<CommitRef>>;
}

/// Git repository accessed through a local bare mirror
pub struct GitSource {
    url: String,
    mirror: PathBuf,
    /// Serializes mirror updates
    lock: Mutex<()>,
}

impl GitSource {
    /// Creates a git source
    ///
    /// # Arguments
    /// * `url` - Remote repository URL
    /// * `mirror` - Directory for the bare mirror (created on first use)
    pub fn new(url: impl Into<String>, mirror: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            mirror: mirror.into(),
            lock: Mutex::new(()),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut full = vec!["--git-dir", path_str(&self.mirror)?];
        full.extend_from_slice(args);
        command::run("git", full, None).await
    }

    /// Clones the mirror if needed and fetches the latest refs
    pub async fn sync(&self) -> Result<(), SourceError> {
        let _guard = self.lock.lock().await;

        if !self.mirror.join("HEAD").exists() {
            info!("Cloning mirror of {} into {}", self.url, self.mirror.display());
            if let Some(parent) = self.mirror.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SourceError::AccessDenied(format!("workspace: {}", e)))?;
            }

            let mirror = path_str(&self.mirror).map_err(|e| SourceError::NotFound(e.to_string()))?;
            let output = command::run("git", ["clone", "--mirror", self.url.as_str(), mirror], None)
                .await
                .map_err(|e| SourceError::NotFound(format!("{:#}", e)))?;
            return check(output);
        }

        debug!("Updating mirror {}", self.mirror.display());
        let output = self
            .git(&["remote", "update", "--prune"])
            .await
            .map_err(|e| SourceError::NotFound(format!("{:#}", e)))?;
        check(output)
    }

    /// Current head commit of a branch
    pub async fn head(&self, branch: &str) -> Result<String, SourceError> {
        let reference = format!("refs/heads/{}", branch);
        let output = self
            .git(&["rev-parse", "--verify", &reference])
            .await
            .map_err(|e| SourceError::NotFound(format!("{:#}", e)))?;

        if !output.success() {
            return Err(SourceError::NotFound(format!("branch '{}'", branch)));
        }
        Ok(output.stdout_str())
    }

    /// Commits reachable from `to` but not from `from`, oldest first
    pub async fn commits_between(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let range = format!("{}..{}", from, to);
        let output = self
            .git(&["rev-list", "--reverse", "--first-parent", &range])
            .await?;

        if !output.success() {
            anyhow::bail!("git rev-list {} failed: {}", range, output.describe());
        }

        Ok(output
            .stdout_str()
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }
}

#[async_trait]
impl SourceRepository for GitSource {
    async fn fetch(&self, commit: &CommitRef) -> Result<Bytes, SourceError> {
        self.sync().await?;

        let object = format!("{}^{{commit}}", commit.commit_id);
        let exists = self
            .git(&["cat-file", "-e", &object])
            .await
            .map_err(|e| SourceError::NotFound(format!("{:#}", e)))?;
        if !exists.success() {
            return Err(SourceError::NotFound(commit.to_string()));
        }

        let branch = format!("refs/heads/{}", commit.branch);
        let on_branch = self
            .git(&["merge-base", "--is-ancestor", &commit.commit_id, &branch])
            .await
            .map_err(|e| SourceError::NotFound(format!("{:#}", e)))?;
        if !on_branch.success() {
            return Err(SourceError::NotFound(format!(
                "{} is not on branch {}",
                commit.commit_id, commit.branch
            )));
        }

        let archive = self
            .git(&["archive", "--format=tar", &commit.commit_id])
            .await
            .map_err(|e| SourceError::NotFound(format!("{:#}", e)))?;
        if !archive.success() {
            return Err(classify(&archive));
        }

        info!(
            "Fetched {} ({} bytes)",
            commit,
            archive.stdout.len()
        );
        Ok(Bytes::from(archive.stdout))
    }
}

/// Polls a branch of a [`GitSource`] for new commits
pub struct GitPoller {
    source: std::sync::Arc<GitSource>,
    branch: String,
    last_seen: Option<String>,
}

impl GitPoller {
    /// Creates a poller
    ///
    /// With `last_seen` unset, the first poll reports the current head.
    pub fn new(
        source: std::sync::Arc<GitSource>,
        branch: impl Into<String>,
        last_seen: Option<String>,
    ) -> Self {
        Self {
            source,
            branch: branch.into(),
            last_seen,
        }
    }
}

#[async_trait]
impl CommitWatcher for GitPoller {
    async fn poll(&mut self) -> Result<Vec<CommitRef>> {
        self.source.sync().await.context("Failed to sync mirror")?;
        let head = self
            .source
            .head(&self.branch)
            .await
            .context("Failed to resolve branch head")?;

        let new_commits = match &self.last_seen {
            Some(last) if *last == head => Vec::new(),
            Some(last) => match self.source.commits_between(last, &head).await {
                Ok(commits) if !commits.is_empty() => commits,
                Ok(_) => vec![head.clone()],
                Err(e) => {
                    // History was rewritten; only the new head is known
                    warn!("Could not list commits since {}: {:#}", last, e);
                    vec![head.clone()]
                }
            },
            None => vec![head.clone()],
        };

        self.last_seen = Some(head);

        Ok(new_commits
            .into_iter()
            .map(|id| CommitRef::new(self.branch.clone(), id))
            .collect())
    }
}

fn check(output: CommandOutput) -> Result<(), SourceError> {
    if output.success() {
        Ok(())
    } else {
        Err(classify(&output))
    }
}

/// Maps git's stderr to the source error taxonomy
fn classify(output: &CommandOutput) -> SourceError {
    let stderr = output.stderr.to_lowercase();
    let denied = [
        "permission denied",
        "authentication failed",
        "could not read username",
        "access denied",
        "403",
    ];

    if denied.iter().any(|needle| stderr.contains(needle)) {
        SourceError::AccessDenied(output.stderr.trim().to_string())
    } else {
        SourceError::NotFound(output.stderr.trim().to_string())
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("non UTF-8 path: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: Vec::new(),
            stderr: stderr.to_string(),
            exit_code: 128,
        }
    }

    #[test]
    fn test_classify_access_denied() {
        let err = classify(&output("git@host: Permission denied (publickey)."));
        assert!(matches!(err, SourceError::AccessDenied(_)));

        let err = classify(&output("fatal: Authentication failed for 'https://host/repo'"));
        assert!(matches!(err, SourceError::AccessDenied(_)));
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify(&output("fatal: repository 'https://host/repo' not found"));
        assert!(matches!(err, SourceError::NotFound(_)));
    }
}
