//! `RemoteBuildService` implementation over the HTTP clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use tryjobs_core::remote::{
    Build, BuildPredicate, BuildUpdate, FailureReason, Heartbeat, PeekPage, Rejection,
    RemoteBuildService, RemoteReply, TaskUpdate,
};
use tryjobs_core::{Job, RemoteHandle, Result};

use crate::{AsyncClient, LegacyClient, PubSubPublisher};

/// Dispatches each call to the protocol generation it belongs to.
pub struct BuildServiceClient {
    legacy: LegacyClient,
    builds: AsyncClient,
    pubsub: PubSubPublisher,
    /// Backend target reported to StartBuild.
    target: String,
}

impl BuildServiceClient {
    pub fn new(
        legacy: LegacyClient,
        builds: AsyncClient,
        pubsub: PubSubPublisher,
        target: impl Into<String>,
    ) -> Self {
        Self {
            legacy,
            builds,
            pubsub,
            target: target.into(),
        }
    }
}

/// The start call a job needs. Legacy builds are started under their
/// lease; async builds exchange the registration token received at intake
/// for an update token, keyed by the job ID so retries are idempotent.
#[derive(Debug, PartialEq, Eq)]
enum StartRequest<'a> {
    Legacy {
        build_id: i64,
        lease_key: i64,
    },
    Async {
        build_id: i64,
        request_id: String,
        registration_token: &'a str,
    },
}

impl<'a> StartRequest<'a> {
    fn for_job(job: &'a Job) -> Self {
        match job.remote() {
            RemoteHandle::Legacy {
                build_id,
                lease_key,
            } => StartRequest::Legacy {
                build_id,
                lease_key,
            },
            RemoteHandle::Async {
                build_id, token, ..
            } => StartRequest::Async {
                build_id,
                request_id: job.id.to_string(),
                registration_token: token,
            },
        }
    }
}

fn non_empty(token: String) -> Option<String> {
    (!token.is_empty()).then_some(token)
}

#[async_trait]
impl RemoteBuildService for BuildServiceClient {
    async fn peek(
        &self,
        bucket: &str,
        max_builds: usize,
        cursor: &str,
    ) -> Result<RemoteReply<PeekPage>> {
        self.legacy.peek(bucket, max_builds, cursor).await
    }

    async fn get_build(&self, build_id: i64) -> Result<Build> {
        self.builds.get_build(build_id).await
    }

    async fn lease(&self, build_id: i64, expiration: DateTime<Utc>) -> Result<RemoteReply<i64>> {
        info!(build_id, "Attempting to lease build");
        self.legacy.lease(build_id, expiration).await
    }

    async fn start(&self, job: &Job, url: &str) -> Result<RemoteReply<Option<String>>> {
        match StartRequest::for_job(job) {
            StartRequest::Legacy {
                build_id,
                lease_key,
            } => {
                info!(job_id = %job.id, build_id, "Legacy start");
                Ok(self
                    .legacy
                    .start(build_id, lease_key, url)
                    .await?
                    .map(|()| None))
            }
            StartRequest::Async {
                build_id,
                request_id,
                registration_token,
            } => {
                info!(job_id = %job.id, build_id, "Async start");
                let update_token = self
                    .builds
                    .start_build(build_id, &request_id, &self.target, registration_token)
                    .await?;
                let update_token = non_empty(update_token);
                if update_token.is_none() {
                    warn!(job_id = %job.id, build_id, "StartBuild returned no update token");
                }
                Ok(Ok(update_token))
            }
        }
    }

    async fn heartbeat(&self, batch: &[Heartbeat]) -> Result<Vec<Option<Rejection>>> {
        info!(count = batch.len(), "Sending heartbeat batch");
        self.legacy.heartbeat(batch).await
    }

    async fn succeed(&self, job: &Job, details_json: &str, url: &str) -> Result<RemoteReply<()>> {
        info!(job_id = %job.id, build_id = job.build_id, "Legacy succeed");
        self.legacy
            .succeed(job.build_id, job.lease_key, details_json, url)
            .await
    }

    async fn fail(
        &self,
        job: &Job,
        reason: FailureReason,
        details_json: &str,
        url: &str,
    ) -> Result<RemoteReply<()>> {
        info!(job_id = %job.id, build_id = job.build_id, reason = reason.as_str(), "Legacy fail");
        self.legacy
            .fail(job.build_id, job.lease_key, reason, details_json, url)
            .await
    }

    async fn cancel_legacy(&self, build_id: i64, details_json: &str) -> Result<RemoteReply<()>> {
        self.legacy.cancel(build_id, details_json).await
    }

    async fn update_build(&self, update: &BuildUpdate, token: &str) -> Result<()> {
        info!(build_id = update.build_id, status = ?update.status, "UpdateBuild");
        self.builds.update_build(update, token).await
    }

    async fn cancel_build(&self, build_id: i64, reason: &str) -> Result<()> {
        info!(build_id, "CancelBuild");
        self.builds.cancel_build(build_id, reason).await
    }

    async fn search(&self, predicate: &BuildPredicate) -> Result<Vec<Build>> {
        self.builds.search(predicate).await
    }

    async fn publish_update(&self, topic: &str, update: &TaskUpdate) -> Result<()> {
        self.pubsub.publish(topic, update).await
    }
}
