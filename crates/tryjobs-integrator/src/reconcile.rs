//! Reports finished jobs to the remote service and keeps running ones alive.

use futures::future::join_all;
use tracing::{info, warn};
use tryjobs_core::remote::{FailureReason, RejectionReason, is_build_already_finished};
use tryjobs_core::{Error, Job, JobStatus, RemoteHandle};

use crate::error::{IntegratorError, Result};
use crate::integrator::TryJobIntegrator;

const DEFAULT_CANCEL_REASON: &str = "Underlying job was canceled.";

impl TryJobIntegrator {
    /// One reconciliation pass over every active job.
    pub async fn update_jobs(&self) -> Result<()> {
        let jobs = self.active_jobs().await?;

        let mut finished = Vec::new();
        let mut legacy = Vec::new();
        let mut pending_async = Vec::new();
        for job in jobs {
            if job.done() {
                finished.push(job);
            } else if job.is_async() {
                pending_async.push(job);
            } else {
                legacy.push(job);
            }
        }

        let (heartbeats, updates, terminal) = tokio::join!(
            self.send_heartbeats(legacy),
            self.send_async_updates(pending_async),
            self.finish_jobs(finished),
        );

        let errs = [heartbeats, updates, terminal]
            .into_iter()
            .filter_map(|r| r.err())
            .collect();
        IntegratorError::collect(errs)
    }

    /// Send terminal notifications, then drop the remote credentials of
    /// every job whose notification landed.
    async fn finish_jobs(&self, jobs: Vec<Job>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let results = join_all(jobs.iter().map(|job| self.job_finished(job))).await;

        let mut errs = Vec::new();
        let mut cleared = Vec::with_capacity(jobs.len());
        for (mut job, result) in jobs.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    job.clear_remote_state();
                    cleared.push(job);
                }
                Err(e) => errs.push(e.for_job(&job)),
            }
        }

        if !cleared.is_empty() {
            match self.db.put_batch(&cleared).await {
                Ok(()) => self.cache.add(&cleared).await,
                Err(e) => errs.push(e.into()),
            }
        }
        IntegratorError::collect(errs)
    }

    /// Tell the remote service that a job reached a terminal state.
    /// Notifications the remote already considers done count as success.
    pub(crate) async fn job_finished(&self, job: &Job) -> Result<()> {
        if !job.done() {
            return Err(IntegratorError::Invariant(format!(
                "job {} is not finished",
                job.id
            )));
        }

        match job.remote() {
            RemoteHandle::Async { .. } if job.status == JobStatus::Canceled => {
                let reason = if job.status_details.is_empty() {
                    DEFAULT_CANCEL_REASON
                } else {
                    job.status_details.as_str()
                };
                self.cancel_build(job, reason).await
            }
            RemoteHandle::Async { token, .. } => match self.update_build(job, token).await {
                Err(IntegratorError::Remote(e)) if is_build_already_finished(&e) => {
                    warn!(job_id = %job.id, build_id = job.build_id, "Tried to update already-finished build");
                    Ok(())
                }
                other => other,
            },
            RemoteHandle::Legacy { build_id, .. } => {
                let details = serde_json::to_string(&serde_json::json!({ "job": job }))
                    .map_err(|e| Error::Internal(format!("failed to encode job: {}", e)))?;
                let url = job.url(&self.config.host);
                let reply = if job.status == JobStatus::Success {
                    info!(job_id = %job.id, build_id, "Reporting success");
                    self.remote.succeed(job, &details, &url).await?
                } else {
                    let reason = FailureReason::for_status(job.status);
                    info!(job_id = %job.id, build_id, reason = reason.as_str(), "Reporting failure");
                    self.remote.fail(job, reason, &details, &url).await?
                };
                match reply {
                    Ok(()) => Ok(()),
                    Err(rejection) if rejection.reason == RejectionReason::BuildIsCompleted => {
                        warn!(job_id = %job.id, build_id, status = %job.status, "Sent terminal status after completion");
                        Ok(())
                    }
                    Err(rejection) => Err(IntegratorError::Rejected {
                        build_id,
                        rejection,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, Fixture, try_job};
    use tryjobs_core::remote::{BUILD_ALREADY_FINISHED_ERR, Rejection};
    use tryjobs_db::JobDb;

    fn finished_legacy(build_id: i64, status: JobStatus) -> Job {
        let mut job = try_job(build_id);
        job.finish(status, "");
        job
    }

    fn async_job(build_id: i64, status: JobStatus) -> Job {
        let mut job = try_job(build_id);
        job.lease_key = 0;
        job.update_token = "tok1".to_string();
        job.pubsub_topic = "projects/skia/topics/updates".to_string();
        if status.is_terminal() {
            job.finish(status, "");
        } else {
            job.status = status;
        }
        job
    }

    #[tokio::test]
    async fn test_legacy_success_and_failure() {
        let f = Fixture::new();
        let ok = finished_legacy(1, JobStatus::Success);
        let failed = finished_legacy(2, JobStatus::Failure);
        let mishap = finished_legacy(3, JobStatus::Mishap);
        f.put(&[ok.clone(), failed.clone(), mishap.clone()]).await;

        f.integrator.update_jobs().await.unwrap();

        let calls = f.remote.calls();
        assert!(calls.contains(&Call::Succeed(1)));
        assert!(calls.contains(&Call::Fail(2, FailureReason::BuildFailure)));
        assert!(calls.contains(&Call::Fail(3, FailureReason::InfraFailure)));
        for job in [ok, failed, mishap] {
            assert_eq!(f.db.get(job.id).await.unwrap().lease_key, 0);
        }
    }

    #[tokio::test]
    async fn test_legacy_payload_carries_job() {
        let f = Fixture::new();
        let job = finished_legacy(1, JobStatus::Success);
        f.integrator.job_finished(&job).await.unwrap();
        let (details, url) = f.remote.terminal_payloads().pop().unwrap();
        let json: serde_json::Value = serde_json::from_str(&details).unwrap();
        assert_eq!(json["job"]["build_id"], 1);
        assert_eq!(url, format!("https://task-scheduler.skia.org/job/{}", job.id));
    }

    #[tokio::test]
    async fn test_failed_notification_keeps_lease() {
        let f = Fixture::new();
        let a = finished_legacy(1, JobStatus::Success);
        let b = finished_legacy(2, JobStatus::Success);
        f.put(&[a.clone(), b.clone()]).await;
        f.remote
            .set_terminal_reply(1, Err(Error::Transport("timeout".into())));

        let err = f.integrator.update_jobs().await.unwrap_err();
        assert_eq!(err.count(), 1);

        // The failure of one job does not block the other.
        assert_eq!(f.db.get(a.id).await.unwrap().lease_key, a.lease_key);
        assert_eq!(f.db.get(b.id).await.unwrap().lease_key, 0);
    }

    #[tokio::test]
    async fn test_completed_rejection_clears_lease() {
        let f = Fixture::new();
        let job = finished_legacy(1, JobStatus::Failure);
        f.put(std::slice::from_ref(&job)).await;
        f.remote.set_terminal_reply(
            1,
            Ok(Err(Rejection::new(RejectionReason::BuildIsCompleted, "done"))),
        );

        f.integrator.update_jobs().await.unwrap();
        assert_eq!(f.db.get(job.id).await.unwrap().lease_key, 0);
    }

    #[tokio::test]
    async fn test_other_rejection_keeps_lease() {
        let f = Fixture::new();
        let job = finished_legacy(1, JobStatus::Failure);
        f.put(std::slice::from_ref(&job)).await;
        f.remote.set_terminal_reply(
            1,
            Ok(Err(Rejection::new(RejectionReason::LeaseExpired, "expired"))),
        );

        assert!(f.integrator.update_jobs().await.is_err());
        assert_eq!(f.db.get(job.id).await.unwrap().lease_key, job.lease_key);
    }

    #[tokio::test]
    async fn test_async_already_finished_clears_token() {
        let f = Fixture::new();
        let job = async_job(1, JobStatus::Success);
        f.put(std::slice::from_ref(&job)).await;
        f.remote.push_update_build(Err(Error::Remote(format!(
            "rpc error: {}",
            BUILD_ALREADY_FINISHED_ERR
        ))));

        f.integrator.update_jobs().await.unwrap();
        assert_eq!(f.remote.update_builds(), vec![(1, "tok1".to_string())]);
        assert_eq!(f.db.get(job.id).await.unwrap().update_token, "");
    }

    #[tokio::test]
    async fn test_async_update_failure_keeps_token() {
        let f = Fixture::new();
        let job = async_job(1, JobStatus::Failure);
        f.put(std::slice::from_ref(&job)).await;
        f.remote
            .push_update_build(Err(Error::Transport("unavailable".into())));

        assert!(f.integrator.update_jobs().await.is_err());
        assert_eq!(f.db.get(job.id).await.unwrap().update_token, "tok1");
    }

    #[tokio::test]
    async fn test_async_success_updates_and_publishes() {
        let f = Fixture::new();
        let job = async_job(1, JobStatus::Success);
        f.put(std::slice::from_ref(&job)).await;

        f.integrator.update_jobs().await.unwrap();
        assert_eq!(f.remote.update_builds().len(), 1);
        assert_eq!(f.remote.publishes(), vec!["1"]);
        assert!(f.remote.async_cancels().is_empty());
        assert_eq!(f.db.get(job.id).await.unwrap().update_token, "");
    }

    #[tokio::test]
    async fn test_async_cancel_uses_default_reason() {
        let f = Fixture::new();
        let job = async_job(1, JobStatus::Canceled);
        f.put(std::slice::from_ref(&job)).await;

        f.integrator.update_jobs().await.unwrap();
        assert_eq!(
            f.remote.async_cancels(),
            vec![(1, DEFAULT_CANCEL_REASON.to_string())]
        );
        assert!(f.remote.update_builds().is_empty());
        assert_eq!(f.db.get(job.id).await.unwrap().update_token, "");
    }

    #[tokio::test]
    async fn test_unfinished_jobs_get_heartbeats_and_updates() {
        let f = Fixture::new();
        let mut legacy = try_job(1);
        legacy.status = JobStatus::InProgress;
        let pending = async_job(2, JobStatus::InProgress);
        let requested = try_job(3);
        f.put(&[legacy, pending, requested]).await;

        f.integrator.update_jobs().await.unwrap();
        assert_eq!(f.remote.heartbeat_batches(), vec![vec![1]]);
        assert_eq!(f.remote.publishes(), vec!["2"]);
        assert!(f.remote.terminal_payloads().is_empty());
    }

    #[tokio::test]
    async fn test_unfinished_job_is_an_invariant_error() {
        let f = Fixture::new();
        assert!(matches!(
            f.integrator.job_finished(&try_job(1)).await,
            Err(IntegratorError::Invariant(_))
        ));
    }
}
