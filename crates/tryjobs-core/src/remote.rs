//! Remote build service types and the `RemoteBuildService` trait.
//!
//! The remote service speaks two protocol generations: a legacy lease
//! protocol (lease, heartbeat, succeed/fail) and an async token protocol
//! (start returns an update token, updates are sent via UpdateBuild and
//! Pub/Sub). Both hide behind one trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Job, JobStatus, Result};

/// Substring of the error returned when StartBuild is called more than once
/// for the same build.
pub const BUILD_ALREADY_STARTED_ERR: &str = "has recorded another StartBuild with request id";

/// Substring of the error returned when UpdateBuild is called after the
/// build has ended.
pub const BUILD_ALREADY_FINISHED_ERR: &str = "cannot update an ended build";

pub fn is_build_already_started(err: &Error) -> bool {
    err.to_string().contains(BUILD_ALREADY_STARTED_ERR)
}

pub fn is_build_already_finished(err: &Error) -> bool {
    err.to_string().contains(BUILD_ALREADY_FINISHED_ERR)
}

/// Reason code of a structured rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// The build was already marked as finished.
    BuildIsCompleted,
    /// Bad request. Returned when leasing an async-protocol build.
    InvalidInput,
    /// Our lease on the build has expired.
    LeaseExpired,
    Other(String),
}

impl RejectionReason {
    pub fn from_code(code: &str) -> Self {
        match code {
            "BUILD_IS_COMPLETED" => RejectionReason::BuildIsCompleted,
            "INVALID_INPUT" => RejectionReason::InvalidInput,
            "LEASE_EXPIRED" => RejectionReason::LeaseExpired,
            other => RejectionReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RejectionReason::BuildIsCompleted => "BUILD_IS_COMPLETED",
            RejectionReason::InvalidInput => "INVALID_INPUT",
            RejectionReason::LeaseExpired => "LEASE_EXPIRED",
            RejectionReason::Other(code) => code,
        }
    }
}

/// A well-known rejection returned alongside a successful RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub message: String,
}

impl Rejection {
    pub fn new(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.reason.as_str())
    }
}

/// Outcome of an RPC that reached the remote service.
pub type RemoteReply<T> = std::result::Result<T, Rejection>;

/// Status of a remote build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    #[default]
    StatusUnspecified,
    Scheduled,
    Started,
    Success,
    Failure,
    InfraFailure,
    Canceled,
}

impl From<JobStatus> for BuildStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Requested => BuildStatus::Scheduled,
            JobStatus::InProgress => BuildStatus::Started,
            JobStatus::Success => BuildStatus::Success,
            JobStatus::Failure => BuildStatus::Failure,
            JobStatus::Mishap => BuildStatus::InfraFailure,
            JobStatus::Canceled => BuildStatus::Canceled,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderId {
    pub project: String,
    pub bucket: String,
    pub builder: String,
}

/// A code review change attached to a build's input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GerritChange {
    pub host: String,
    pub project: String,
    pub change: i64,
    pub patchset: i64,
}

/// A remote build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub id: i64,
    pub builder: BuilderId,
    pub status: BuildStatus,
    pub create_time: DateTime<Utc>,
    pub gerrit_changes: Vec<GerritChange>,
}

/// One page of pending builds in a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeekPage {
    pub build_ids: Vec<i64>,
    /// Empty on the last page.
    pub next_cursor: String,
}

/// One lease renewal within a heartbeat batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub build_id: i64,
    pub lease_key: i64,
    pub expiration: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    BuildFailure,
    InfraFailure,
}

impl FailureReason {
    pub fn for_status(status: JobStatus) -> Self {
        if status == JobStatus::Mishap {
            FailureReason::InfraFailure
        } else {
            FailureReason::BuildFailure
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::BuildFailure => "BUILD_FAILURE",
            FailureReason::InfraFailure => "INFRA_FAILURE",
        }
    }
}

/// Search predicate for remote builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPredicate {
    pub project: String,
    pub bucket: String,
    pub status: BuildStatus,
    /// Only builds created before this instant.
    pub created_before: DateTime<Utc>,
}

/// The backend task backing a remote build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    pub target: String,
    /// Local job id.
    pub id: String,
    pub status: BuildStatus,
    pub summary_markdown: String,
    pub link: String,
    /// Monotonic update id; later updates supersede earlier ones.
    pub update_id: i64,
}

impl BuildTask {
    pub fn for_job(job: &Job, target: &str, host: &str) -> Self {
        Self {
            target: target.to_string(),
            id: job.id.to_string(),
            status: job.status.into(),
            summary_markdown: job.status_details.clone(),
            link: job.url(host),
            update_id: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        }
    }
}

/// Full build state sent with UpdateBuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildUpdate {
    pub build_id: i64,
    pub status: BuildStatus,
    pub summary_markdown: String,
    pub task: BuildTask,
}

impl BuildUpdate {
    pub fn for_job(job: &Job, target: &str, host: &str) -> Self {
        Self {
            build_id: job.build_id,
            status: job.status.into(),
            summary_markdown: job.status_details.clone(),
            task: BuildTask::for_job(job, target, host),
        }
    }
}

/// Task update published over Pub/Sub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub build_id: String,
    pub task: BuildTask,
}

impl TaskUpdate {
    pub fn for_job(job: &Job, target: &str, host: &str) -> Self {
        Self {
            build_id: job.build_id.to_string(),
            task: BuildTask::for_job(job, target, host),
        }
    }
}

/// The remote build service.
///
/// `Err` is a transport failure; `Ok(Err(rejection))` is a structured
/// rejection from a request that otherwise succeeded.
#[async_trait]
pub trait RemoteBuildService: Send + Sync {
    /// List pending builds in a bucket, one page at a time. Legacy only.
    async fn peek(&self, bucket: &str, max_builds: usize, cursor: &str)
    -> Result<RemoteReply<PeekPage>>;

    async fn get_build(&self, build_id: i64) -> Result<Build>;

    /// Acquire a lease until `expiration`, returning the lease key. Legacy only.
    async fn lease(&self, build_id: i64, expiration: DateTime<Utc>) -> Result<RemoteReply<i64>>;

    /// Notify the service that work on the job's build has begun. Returns
    /// the update token under the async protocol.
    async fn start(&self, job: &Job, url: &str) -> Result<RemoteReply<Option<String>>>;

    /// Renew leases in one batch. Returns one entry per heartbeat, in order.
    async fn heartbeat(&self, batch: &[Heartbeat]) -> Result<Vec<Option<Rejection>>>;

    /// Legacy success notification carrying a JSON result payload.
    async fn succeed(&self, job: &Job, details_json: &str, url: &str) -> Result<RemoteReply<()>>;

    /// Legacy failure notification carrying a JSON result payload.
    async fn fail(
        &self,
        job: &Job,
        reason: FailureReason,
        details_json: &str,
        url: &str,
    ) -> Result<RemoteReply<()>>;

    /// Legacy cancellation.
    async fn cancel_legacy(&self, build_id: i64, details_json: &str) -> Result<RemoteReply<()>>;

    /// Async update. Fails with an "already finished" error once the
    /// build has ended.
    async fn update_build(&self, update: &BuildUpdate, token: &str) -> Result<()>;

    /// Async cancellation.
    async fn cancel_build(&self, build_id: i64, reason: &str) -> Result<()>;

    async fn search(&self, predicate: &BuildPredicate) -> Result<Vec<Build>>;

    /// Publish a task update on the message channel. Delivery is
    /// at-least-once.
    async fn publish_update(&self, topic: &str, update: &TaskUpdate) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_reason_codes() {
        for code in ["BUILD_IS_COMPLETED", "INVALID_INPUT", "LEASE_EXPIRED", "BOGUS"] {
            assert_eq!(RejectionReason::from_code(code).as_str(), code);
        }
        assert_eq!(
            RejectionReason::from_code("BOGUS"),
            RejectionReason::Other("BOGUS".to_string())
        );
    }

    #[test]
    fn test_idempotency_errors() {
        let started = Error::Remote(format!("build 42 {} abc", BUILD_ALREADY_STARTED_ERR));
        assert!(is_build_already_started(&started));
        assert!(!is_build_already_finished(&started));

        let finished = Error::Remote("cannot update an ended build".to_string());
        assert!(is_build_already_finished(&finished));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(BuildStatus::from(JobStatus::Mishap), BuildStatus::InfraFailure);
        assert_eq!(BuildStatus::from(JobStatus::InProgress), BuildStatus::Started);
        assert_eq!(FailureReason::for_status(JobStatus::Mishap).as_str(), "INFRA_FAILURE");
        assert_eq!(FailureReason::for_status(JobStatus::Canceled).as_str(), "BUILD_FAILURE");
    }
}
