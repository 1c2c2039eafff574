//! Lease renewal for legacy builds and progress updates for async ones.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use tryjobs_core::Job;
use tryjobs_core::remote::{Heartbeat, Rejection, RejectionReason};

use crate::error::{IntegratorError, Result};
use crate::integrator::{LocalCancel, TryJobIntegrator, expiration_after};

/// What to do about one job after its heartbeat result came back.
enum Followup {
    Release(Job, Rejection),
    Cancel(Job, String),
}

impl TryJobIntegrator {
    /// Renew the leases of unfinished legacy jobs in batches.
    pub(crate) async fn send_heartbeats(&self, mut jobs: Vec<Job>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        jobs.sort_by_key(|j| j.build_id);
        let expiration = expiration_after(self.config.renewal_lease);

        info!(count = jobs.len(), "Sending heartbeats");
        let results = join_all(
            jobs.chunks(self.config.heartbeat_batch_size.max(1))
                .map(|batch| self.send_heartbeat_batch(batch, expiration)),
        )
        .await;
        info!("Finished sending heartbeats");
        IntegratorError::collect(results.into_iter().filter_map(|r| r.err()).collect())
    }

    async fn send_heartbeat_batch(&self, jobs: &[Job], expiration: DateTime<Utc>) -> Result<()> {
        let heartbeats: Vec<Heartbeat> = jobs
            .iter()
            .map(|j| Heartbeat {
                build_id: j.build_id,
                lease_key: j.lease_key,
                expiration,
            })
            .collect();

        debug!(count = heartbeats.len(), "Sending heartbeat batch");
        let results = self.remote.heartbeat(&heartbeats).await?;
        if results.len() != jobs.len() {
            error!(
                expected = jobs.len(),
                got = results.len(),
                "Heartbeat response has the wrong number of results"
            );
            return Err(IntegratorError::Invariant(format!(
                "heartbeat response has {} results for {} jobs",
                results.len(),
                jobs.len()
            )));
        }

        let followups: Vec<Followup> = jobs
            .iter()
            .zip(results)
            .filter_map(|(job, result)| {
                let rejection = result?;
                match rejection.reason {
                    // The build was canceled remotely, e.g. because a newer
                    // patchset was uploaded.
                    RejectionReason::BuildIsCompleted => {
                        debug!(job_id = %job.id, build_id = job.build_id, "Heartbeat for completed build");
                        None
                    }
                    RejectionReason::LeaseExpired => Some(Followup::Release(job.clone(), rejection)),
                    _ => {
                        error!(job_id = %job.id, build_id = job.build_id, %rejection, "Heartbeat rejected; canceling");
                        let reason =
                            format!("Remote service rejected heartbeat with: {}", rejection.reason.as_str());
                        Some(Followup::Cancel(job.clone(), reason))
                    }
                }
            })
            .collect();

        let mut errs = Vec::new();
        let mut cancels = Vec::new();
        for followup in followups {
            match followup {
                Followup::Release(job, rejection) => match self.release(&job).await {
                    Ok(key) => {
                        info!(job_id = %job.id, build_id = job.build_id, "Re-leased build");
                        if let Err(e) = self.store_lease_key(&job, key).await {
                            errs.push(e);
                        }
                    }
                    Err(e) => {
                        error!(job_id = %job.id, build_id = job.build_id, error = %e, "Failed to re-lease build; canceling");
                        let reason = format!(
                            "Remote service rejected heartbeat and failed to re-lease with: {}",
                            e
                        );
                        errs.push(IntegratorError::ReleaseFailed {
                            build_id: job.build_id,
                            rejection,
                            source: Box::new(e),
                        });
                        cancels.push((job, reason));
                    }
                },
                Followup::Cancel(job, reason) => cancels.push((job, reason)),
            }
        }

        // Tell the remote service first; credentials are only dropped once
        // it has acknowledged the cancellation.
        let mut local = Vec::with_capacity(cancels.len());
        for (job, reason) in cancels {
            let cancel = match self.remote_cancel_legacy(job.build_id, &reason).await {
                Ok(()) => LocalCancel::new(job.id, reason).acknowledged(),
                Err(e) => {
                    errs.push(e.for_job(&job));
                    LocalCancel::new(job.id, reason)
                }
            };
            local.push(cancel);
        }
        if let Err(e) = self.local_cancel(local).await {
            errs.push(e);
        }

        IntegratorError::collect(errs)
    }

    /// Lease an expired build once more.
    async fn release(&self, job: &Job) -> Result<i64> {
        match self.lease(job.build_id).await? {
            Ok(0) => Err(IntegratorError::Invalid(
                "remote service returned zero lease key".to_string(),
            )),
            Ok(key) => Ok(key),
            Err(rejection) => Err(IntegratorError::Rejected {
                build_id: job.build_id,
                rejection,
            }),
        }
    }

    /// Record a new lease key on the current copy of the job. Nothing else
    /// is written, so progress made while the heartbeat was in flight
    /// stays intact.
    async fn store_lease_key(&self, job: &Job, key: i64) -> Result<()> {
        let mut current = self
            .db
            .get(job.id)
            .await
            .map_err(|e| IntegratorError::from(e).for_job(job))?;
        if current.done() && current.lease_key == 0 {
            info!(job_id = %job.id, build_id = job.build_id, "Job already reported; dropping new lease");
            return Ok(());
        }
        current.lease_key = key;
        self.db
            .put(&current)
            .await
            .map_err(|e| IntegratorError::from(e).for_job(&current))?;
        self.cache.add(std::slice::from_ref(&current)).await;
        Ok(())
    }

    /// Publish the current state of unfinished async jobs.
    pub(crate) async fn send_async_updates(&self, jobs: Vec<Job>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        info!(count = jobs.len(), "Sending async updates");
        let results = join_all(jobs.iter().map(|job| self.publish(job))).await;
        let errs: Vec<IntegratorError> = results.into_iter().filter_map(|r| r.err()).collect();
        if !errs.is_empty() {
            warn!(failed = errs.len(), "Some async updates failed");
        }
        IntegratorError::collect(errs)
    }
}
