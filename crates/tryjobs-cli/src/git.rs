//! Repo resolution and task configuration backed by local git checkouts.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tryjobs_core::review::RepoResolver;
use tryjobs_core::task_cfg::{TaskCfg, TaskCfgCache};
use tryjobs_core::{Error, RepoState, Result};

/// Location of the task configuration within a repo.
pub const TASKS_CFG_FILE: &str = "infra/bots/tasks.json";

/// Gerrit ref holding a patchset, e.g. `refs/changes/23/123/4`.
pub fn change_ref(issue: &str, patchset: &str) -> String {
    let shard = issue.get(issue.len().saturating_sub(2)..).unwrap_or(issue);
    format!("refs/changes/{:0>2}/{}/{}", shard, issue, patchset)
}

async fn git(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    debug!(dir = %dir.display(), ?args, "Running git");
    Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Internal(format!("failed to run git: {}", e)))
}

/// Repos with a local checkout, keyed by URL.
pub struct GitRepos {
    checkouts: BTreeMap<String, PathBuf>,
}

impl GitRepos {
    pub fn new(checkouts: BTreeMap<String, PathBuf>) -> Self {
        Self { checkouts }
    }

    fn checkout(&self, repo: &str) -> Result<&Path> {
        self.checkouts
            .get(repo)
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::NotFound(format!("no checkout for repo {}", repo)))
    }
}

#[async_trait]
impl RepoResolver for GitRepos {
    fn knows_repo(&self, repo: &str) -> bool {
        self.checkouts.contains_key(repo)
    }

    async fn resolve(&self, repo: &str, reference: &str) -> Result<Option<String>> {
        let dir = self.checkout(repo)?;
        // Branches are looked up on the remote first so a stale local
        // branch never shadows it.
        for candidate in [format!("origin/{}", reference), reference.to_string()] {
            let spec = format!("{}^{{commit}}", candidate);
            let out = git(dir, &["rev-parse", "--verify", "--quiet", &spec]).await?;
            if out.status.success() {
                let hash = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if !hash.is_empty() {
                    return Ok(Some(hash));
                }
            }
        }
        Ok(None)
    }
}

/// Task configurations read from the checkouts, with the patch applied
/// for try jobs. Configs that fail to parse are remembered as permanent
/// errors; fetch failures are not cached.
pub struct GitTaskCfgCache {
    repos: Arc<GitRepos>,
    cache: RwLock<HashMap<RepoState, std::result::Result<TaskCfg, String>>>,
}

impl GitTaskCfgCache {
    pub fn new(repos: Arc<GitRepos>) -> Self {
        Self {
            repos,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Commit whose tree holds the config for `rs`.
    async fn config_commit(&self, dir: &Path, rs: &RepoState) -> Result<String> {
        if !rs.is_try_job() {
            return Ok(rs.revision.clone());
        }
        let reference = change_ref(&rs.patch.issue, &rs.patch.patchset);
        let out = git(dir, &["fetch", "--quiet", "origin", &reference]).await?;
        if !out.status.success() {
            return Err(Error::Transport(format!(
                "failed to fetch {}: {}",
                reference,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok("FETCH_HEAD".to_string())
    }
}

#[async_trait]
impl TaskCfgCache for GitTaskCfgCache {
    async fn get_or_cache_repo_state(&self, rs: &RepoState) -> Result<()> {
        if self.cache.read().await.contains_key(rs) {
            return Ok(());
        }
        let dir = self.repos.checkout(&rs.repo)?;
        let commit = self.config_commit(dir, rs).await?;
        let object = format!("{}:{}", commit, TASKS_CFG_FILE);
        let out = git(dir, &["show", &object]).await?;

        let entry = if out.status.success() {
            TaskCfg::from_json(&String::from_utf8_lossy(&out.stdout)).map_err(|e| e.to_string())
        } else {
            Err(format!(
                "failed to read {}: {}",
                TASKS_CFG_FILE,
                String::from_utf8_lossy(&out.stderr).trim()
            ))
        };
        match &entry {
            Ok(_) => info!(repo_state = %rs, "Cached task config"),
            Err(e) => warn!(repo_state = %rs, error = %e, "Caching task config error"),
        }
        self.cache.write().await.insert(rs.clone(), entry);
        Ok(())
    }

    async fn get(&self, rs: &RepoState) -> Result<TaskCfg> {
        match self.cache.read().await.get(rs) {
            Some(Ok(cfg)) => Ok(cfg.clone()),
            Some(Err(e)) => Err(Error::CachedConfig(e.clone())),
            None => Err(Error::NotFound(format!("no task config for {}", rs))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_ref() {
        assert_eq!(change_ref("123", "4"), "refs/changes/23/123/4");
        assert_eq!(change_ref("527502", "1"), "refs/changes/02/527502/1");
        assert_eq!(change_ref("5", "2"), "refs/changes/05/5/2");
    }

    #[tokio::test]
    async fn test_unknown_repo() {
        let repos = Arc::new(GitRepos::new(BTreeMap::new()));
        assert!(!repos.knows_repo("https://example.com/repo.git"));
        assert!(matches!(
            repos.resolve("https://example.com/repo.git", "main").await,
            Err(Error::NotFound(_))
        ));

        let cache = GitTaskCfgCache::new(repos);
        assert!(matches!(
            cache.get(&RepoState::default()).await,
            Err(Error::NotFound(_))
        ));
    }
}
