//! Promotes requested jobs to in-progress and tells the remote service.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tryjobs_core::remote::is_build_already_started;
use tryjobs_core::{Job, JobStatus, truncate};

use crate::error::{IntegratorError, Result};
use crate::integrator::{LocalCancel, MAX_DETAILS_LEN, TryJobIntegrator};

const ALREADY_STARTED_REASON: &str = "StartBuild has already been called for this job, but the job was not correctly updated and cannot continue.";

impl TryJobIntegrator {
    /// Start requested jobs as they show up on the modified-jobs stream,
    /// and periodically rescan the database for any the stream missed.
    pub async fn run_start_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut modified: Option<mpsc::Receiver<Vec<Job>>> = match self.db.modified_jobs().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!(error = %e, "Failed to subscribe to modified jobs; relying on periodic scan");
                None
            }
        };
        let mut ticker = tokio::time::interval(self.config.start_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = async {
                    match modified.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match batch {
                    Some(jobs) => {
                        for job in jobs.iter().filter(|j| j.status == JobStatus::Requested) {
                            info!(job_id = %job.id, build_id = job.build_id, "Found job via modified jobs stream");
                            if let Err(e) = self.start_job(job).await {
                                error!(job_id = %job.id, build_id = job.build_id, error = %e, "Failed to start job");
                            }
                        }
                    }
                    None => {
                        warn!("Modified jobs stream closed; relying on periodic scan");
                        modified = None;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.start_requested_jobs().await {
                        error!(error = %e, "Failed to start requested jobs");
                    }
                }
            }
        }
        info!("Job starter stopped");
    }

    /// Start every requested job in the database.
    pub async fn start_requested_jobs(&self) -> Result<()> {
        let jobs = self.db.scan_by_status(JobStatus::Requested).await?;
        let mut errs = Vec::new();
        for job in &jobs {
            info!(job_id = %job.id, build_id = job.build_id, "Found job via periodic scan");
            if let Err(e) = self.start_job(job).await {
                errs.push(e.for_job(job));
            }
        }
        IntegratorError::collect(errs)
    }

    /// Move a requested job to in-progress. The job is re-read first, so
    /// a job started via another path is left alone. Preparation failures
    /// become MISHAP; transport errors from the remote start are returned
    /// and retried by the next scan.
    pub async fn start_job(&self, job: &Job) -> Result<()> {
        let mut job = self.db.get(job.id).await?;
        if job.status != JobStatus::Requested {
            info!(job_id = %job.id, build_id = job.build_id, "Job has already started; skipping");
            return Ok(());
        }

        info!(job_id = %job.id, build_id = job.build_id, lease_key = job.lease_key, "Starting job");
        if let Err(e) = self.prepare_job(&mut job).await {
            info!(job_id = %job.id, build_id = job.build_id, error = %e, "Failed to start job");
            job.finish(
                JobStatus::Mishap,
                truncate(&format!("Failed to start job: {}", e), MAX_DETAILS_LEN),
            );
        } else {
            job.status = JobStatus::InProgress;
            let url = job.url(&self.config.host);
            match self.remote.start(&job, &url).await {
                Ok(Ok(Some(token))) => job.update_token = token,
                Ok(Ok(None)) => {
                    if job.is_async() {
                        warn!(job_id = %job.id, build_id = job.build_id, "Started job but have no update token");
                    }
                }
                Ok(Err(rejection)) => {
                    warn!(job_id = %job.id, build_id = job.build_id, %rejection, "Remote service rejected start");
                    let reason = format!("Remote service rejected start with: {}", rejection.reason.as_str());
                    return self.local_cancel(vec![LocalCancel::new(job.id, reason)]).await;
                }
                Err(e) if is_build_already_started(&e) => {
                    warn!(job_id = %job.id, build_id = job.build_id, error = %e, "Build was already started");
                    return self
                        .local_cancel(vec![LocalCancel::new(job.id, ALREADY_STARTED_REASON)])
                        .await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.db.put(&job).await?;
        self.cache.add(std::slice::from_ref(&job)).await;
        info!(job_id = %job.id, build_id = job.build_id, status = %job.status, "Updated job");
        Ok(())
    }

    /// Resolve the job's revision, load its task graph and decide whether
    /// it is a forced re-run.
    async fn prepare_job(&self, job: &mut Job) -> Result<()> {
        let repo = job.repo_state.repo.clone();
        if !self.repos.knows_repo(&repo) {
            return Err(IntegratorError::Invalid(format!("unknown repo {}", repo)));
        }

        job.repo_state.revision = if job.repo_state.revision.is_empty() {
            let issue: i64 = job.issue().parse().map_err(|e| {
                IntegratorError::Invalid(format!("failed to parse issue {:?}: {}", job.issue(), e))
            })?;
            let branch = self.review.change_branch(issue).await?;
            self.repos
                .resolve(&repo, &branch)
                .await?
                .ok_or_else(|| IntegratorError::Invalid(format!("unknown branch {}", branch)))?
        } else {
            self.repos
                .resolve(&repo, &job.repo_state.revision)
                .await?
                .ok_or_else(|| {
                    IntegratorError::Invalid(format!(
                        "unknown revision {}",
                        job.repo_state.revision
                    ))
                })?
        };

        let rs = &job.repo_state;
        if !rs.valid() || !rs.is_try_job() || self.filter.skip(rs) {
            return Err(IntegratorError::Invalid(format!("invalid repo state: {}", rs)));
        }

        self.task_cfg.get_or_cache_repo_state(rs).await?;
        let cfg = self.task_cfg.get(rs).await?;
        let spec = cfg
            .jobs
            .get(&job.name)
            .ok_or_else(|| IntegratorError::Invalid(format!("no such job: {}", job.name)))?;
        job.dependencies = spec.task_dag(&cfg)?;

        // A previous job for the same repo state means this is a manual
        // retry; force it so its tasks are not deduplicated away.
        let previous = self.cache.by_repo_state(&job.name, &job.repo_state).await;
        if previous.iter().any(|j| j.id != job.id) {
            job.is_force = true;
        }
        Ok(())
    }
}
