//! Jobs and the repository state they run against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::JobId;

/// Status of a job.
///
/// `Requested` and `InProgress` are the only non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Requested,
    InProgress,
    Success,
    Failure,
    Mishap,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Requested | JobStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Requested => "REQUESTED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
            JobStatus::Mishap => "MISHAP",
            JobStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUESTED" => Ok(JobStatus::Requested),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILURE" => Ok(JobStatus::Failure),
            "MISHAP" => Ok(JobStatus::Mishap),
            "CANCELED" => Ok(JobStatus::Canceled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// A pending code-review patch applied on top of a revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Patch {
    /// Code review server, e.g. `https://skia-review.googlesource.com`.
    pub server: String,
    pub issue: String,
    pub patchset: String,
    /// Repository the patch applies to.
    pub patch_repo: String,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
            && self.issue.is_empty()
            && self.patchset.is_empty()
            && self.patch_repo.is_empty()
    }

    /// All patch fields are set.
    pub fn is_full(&self) -> bool {
        !self.server.is_empty()
            && !self.issue.is_empty()
            && !self.patchset.is_empty()
            && !self.patch_repo.is_empty()
    }
}

/// The repository, revision and optional patch a job runs against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoState {
    pub repo: String,
    /// Commit hash. May be empty or a branch name until resolved.
    pub revision: String,
    #[serde(default)]
    pub patch: Patch,
}

impl RepoState {
    /// A repo state is valid when it names a repo and revision, and its
    /// patch is either absent or complete.
    pub fn valid(&self) -> bool {
        !self.repo.is_empty()
            && !self.revision.is_empty()
            && (self.patch.is_empty() || self.patch.is_full())
    }

    pub fn is_try_job(&self) -> bool {
        !self.patch.is_empty()
    }
}

impl std::fmt::Display for RepoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repo, self.revision)?;
        if !self.patch.is_empty() {
            write!(
                f,
                " + {}/{}/{} ({})",
                self.patch.server, self.patch.issue, self.patch.patchset, self.patch.patch_repo
            )?;
        }
        Ok(())
    }
}

/// A job tracked by the local job database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Name of the job spec within the repo's task configuration.
    pub name: String,
    /// Id of the corresponding remote build.
    pub build_id: i64,
    /// Lease key held under the legacy protocol; zero when not held.
    pub lease_key: i64,
    /// Update token issued under the async protocol; empty when not held.
    pub update_token: String,
    /// Pub/Sub topic for async updates. Non-empty marks the async protocol.
    pub pubsub_topic: String,
    pub repo_state: RepoState,
    pub status: JobStatus,
    pub status_details: String,
    /// Bypass task-level deduplication for forced re-runs.
    pub is_force: bool,
    /// Task name to the names of the tasks it depends on.
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub requested: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

/// Which remote protocol generation a job talks, with the credential it
/// holds for that protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteHandle<'a> {
    Legacy { build_id: i64, lease_key: i64 },
    Async {
        build_id: i64,
        token: &'a str,
        topic: &'a str,
    },
}

impl Job {
    /// Create a new requested job for a remote build.
    pub fn new_requested(
        name: impl Into<String>,
        build_id: i64,
        repo_state: RepoState,
        requested: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            build_id,
            lease_key: 0,
            update_token: String::new(),
            pubsub_topic: String::new(),
            repo_state,
            status: JobStatus::Requested,
            status_details: String::new(),
            is_force: false,
            dependencies: BTreeMap::new(),
            requested,
            created: Utc::now(),
            finished: None,
        }
    }

    pub fn done(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_async(&self) -> bool {
        !self.pubsub_topic.is_empty()
    }

    pub fn remote(&self) -> RemoteHandle<'_> {
        if self.is_async() {
            RemoteHandle::Async {
                build_id: self.build_id,
                token: &self.update_token,
                topic: &self.pubsub_topic,
            }
        } else {
            RemoteHandle::Legacy {
                build_id: self.build_id,
                lease_key: self.lease_key,
            }
        }
    }

    /// Holds a lease key or update token and has left the requested state.
    pub fn is_active(&self) -> bool {
        (self.lease_key != 0 || !self.update_token.is_empty())
            && self.status != JobStatus::Requested
    }

    /// Move to a terminal status, stamping `finished`.
    pub fn finish(&mut self, status: JobStatus, details: impl Into<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.status_details = details.into();
        self.finished = Some(Utc::now());
    }

    /// Drop the remote credentials once the terminal notification landed.
    pub fn clear_remote_state(&mut self) {
        self.lease_key = 0;
        self.update_token.clear();
    }

    pub fn url(&self, host: &str) -> String {
        format!("https://{}/job/{}", host, self.id)
    }

    pub fn issue(&self) -> &str {
        &self.repo_state.patch.issue
    }
}
