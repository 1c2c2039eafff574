//! Collaborators used to resolve a try job's revision.

use async_trait::async_trait;

use crate::Result;

/// Code review system. Only used to find the branch a change targets.
#[async_trait]
pub trait CodeReview: Send + Sync {
    /// Name of the branch the given change was uploaded against.
    async fn change_branch(&self, issue: i64) -> Result<String>;
}

/// Known repositories and their refs.
#[async_trait]
pub trait RepoResolver: Send + Sync {
    fn knows_repo(&self, repo: &str) -> bool;

    /// Resolve a branch name or commit hash to a commit hash. Returns
    /// `None` if the reference does not exist in the repo.
    async fn resolve(&self, repo: &str, reference: &str) -> Result<Option<String>>;
}
