//! The try job integrator and its periodic loops.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tryjobs_config::IntegratorConfig;
use tryjobs_core::remote::{BuildUpdate, RemoteBuildService, RemoteReply, TaskUpdate};
use tryjobs_core::review::{CodeReview, RepoResolver};
use tryjobs_core::task_cfg::TaskCfgCache;
use tryjobs_core::{Job, JobId, JobStatus, truncate};
use tryjobs_db::{JobCache, JobDb, JobSearchParams};

use crate::denylist::{RepoStateFilter, SkipList};
use crate::error::{IntegratorError, Result};
use crate::liveness::Liveness;

/// Maximum length of cancellation reasons and status details.
pub const MAX_DETAILS_LEN: usize = 1024;

/// Publish attempts per task update before giving up until the next tick.
const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_BACKOFF: Duration = Duration::from_millis(500);

/// A job to cancel locally. Remote credentials are kept so the reconciler
/// still reports the cancellation, unless the remote service already
/// acknowledged it.
#[derive(Debug)]
pub(crate) struct LocalCancel {
    pub(crate) id: JobId,
    pub(crate) reason: String,
    pub(crate) clear_remote: bool,
}

impl LocalCancel {
    pub(crate) fn new(id: JobId, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
            clear_remote: false,
        }
    }

    pub(crate) fn acknowledged(mut self) -> Self {
        self.clear_remote = true;
        self
    }
}

/// External systems the integrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub db: Arc<dyn JobDb>,
    pub cache: Arc<dyn JobCache>,
    pub remote: Arc<dyn RemoteBuildService>,
    pub review: Arc<dyn CodeReview>,
    pub repos: Arc<dyn RepoResolver>,
    pub task_cfg: Arc<dyn TaskCfgCache>,
}

/// Keeps local jobs and remote builds in agreement.
pub struct TryJobIntegrator {
    pub(crate) config: IntegratorConfig,
    pub(crate) db: Arc<dyn JobDb>,
    pub(crate) cache: Arc<dyn JobCache>,
    pub(crate) remote: Arc<dyn RemoteBuildService>,
    pub(crate) review: Arc<dyn CodeReview>,
    pub(crate) repos: Arc<dyn RepoResolver>,
    pub(crate) task_cfg: Arc<dyn TaskCfgCache>,
    pub(crate) filter: Arc<dyn RepoStateFilter>,
}

impl TryJobIntegrator {
    pub fn new(config: IntegratorConfig, deps: Collaborators) -> Self {
        let filter = Arc::new(SkipList::new(config.skip_repo_states.clone()));
        Self {
            config,
            db: deps.db,
            cache: deps.cache,
            remote: deps.remote,
            review: deps.review,
            repos: deps.repos,
            task_cfg: deps.task_cfg,
            filter,
        }
    }

    /// Replace the repo-state denylist built from the configuration.
    pub fn with_filter(mut self, filter: Arc<dyn RepoStateFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }

    /// Spawn the update, poll and cleanup loops plus the job starter. All
    /// of them stop once `shutdown` is cancelled; a tick already underway
    /// runs to completion.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(bucket = %self.config.bucket, "Starting try job integrator");

        let this = self.clone();
        let update = tokio::spawn(run_periodic(
            "update_tryjob_state",
            self.config.update_interval,
            shutdown.clone(),
            move || {
                let this = this.clone();
                async move { this.update_jobs().await }
            },
        ));

        let this = self.clone();
        let poll = tokio::spawn(run_periodic(
            "poll_for_new_tryjobs",
            self.config.poll_interval,
            shutdown.clone(),
            move || {
                let this = this.clone();
                async move { this.poll().await }
            },
        ));

        let this = self.clone();
        let cleanup = tokio::spawn(run_periodic(
            "cleanup_started_builds",
            self.config.cleanup_interval,
            shutdown.clone(),
            move || {
                let this = this.clone();
                async move { this.cleanup().await }
            },
        ));

        let starter = tokio::spawn(self.run_start_loop(shutdown));

        vec![update, poll, cleanup, starter]
    }

    /// Jobs that have left the requested state and still hold a lease key
    /// or update token.
    pub(crate) async fn active_jobs(&self) -> Result<Vec<Job>> {
        self.cache.update().await?;
        Ok(self
            .cache
            .all()
            .await
            .into_iter()
            .filter(Job::is_active)
            .collect())
    }

    /// The local job for a remote build, if one was created within the
    /// search window.
    pub(crate) async fn find_job_for_build(&self, build_id: i64) -> Result<Option<Job>> {
        let window = chrono::Duration::from_std(self.config.search_window)
            .map_err(|e| IntegratorError::Invariant(format!("search window: {}", e)))?;
        let found = self
            .db
            .search(&JobSearchParams {
                build_id: Some(build_id),
                time_start: Some(Utc::now() - window),
                ..Default::default()
            })
            .await?;
        Ok(found.into_iter().next())
    }

    /// Cancel jobs in the local database. Each job is re-read first, and
    /// jobs that reached a terminal status in the meantime are left alone.
    pub(crate) async fn local_cancel(&self, cancels: Vec<LocalCancel>) -> Result<()> {
        if cancels.is_empty() {
            return Ok(());
        }
        let mut jobs = Vec::with_capacity(cancels.len());
        for cancel in cancels {
            let mut job = self.db.get(cancel.id).await?;
            if job.done() {
                info!(job_id = %job.id, build_id = job.build_id, status = %job.status, "Job finished before it could be canceled");
                continue;
            }
            warn!(job_id = %job.id, build_id = job.build_id, reason = %cancel.reason, "Canceling job");
            job.finish(JobStatus::Canceled, truncate(&cancel.reason, MAX_DETAILS_LEN));
            if cancel.clear_remote {
                job.clear_remote_state();
            }
            jobs.push(job);
        }
        if jobs.is_empty() {
            return Ok(());
        }
        self.db.put_batch(&jobs).await?;
        self.cache.add(&jobs).await;
        Ok(())
    }

    /// Lease a legacy build for the initial lease duration.
    pub(crate) async fn lease(&self, build_id: i64) -> tryjobs_core::Result<RemoteReply<i64>> {
        let expiration = expiration_after(self.config.initial_lease);
        self.remote.lease(build_id, expiration).await
    }

    /// Cancel a legacy build remotely.
    pub(crate) async fn remote_cancel_legacy(&self, build_id: i64, reason: &str) -> Result<()> {
        warn!(build_id, reason, "Canceling remote build");
        let details = serde_json::json!({ "message": truncate(reason, MAX_DETAILS_LEN) });
        match self
            .remote
            .cancel_legacy(build_id, &details.to_string())
            .await?
        {
            Ok(()) => Ok(()),
            Err(rejection) => Err(IntegratorError::Rejected {
                build_id,
                rejection,
            }),
        }
    }

    /// Send the job's full state to an async build, then publish it.
    pub(crate) async fn update_build(&self, job: &Job, token: &str) -> Result<()> {
        info!(job_id = %job.id, build_id = job.build_id, "UpdateBuild");
        let update = BuildUpdate::for_job(job, &self.config.target, &self.config.host);
        self.remote.update_build(&update, token).await?;
        self.publish(job).await
    }

    /// Cancel an async build, then publish the job's state.
    pub(crate) async fn cancel_build(&self, job: &Job, reason: &str) -> Result<()> {
        info!(job_id = %job.id, build_id = job.build_id, "CancelBuild");
        self.remote
            .cancel_build(job.build_id, &truncate(reason, MAX_DETAILS_LEN))
            .await?;
        self.publish(job).await
    }

    /// Publish a task update for an async job, retrying transient failures.
    pub(crate) async fn publish(&self, job: &Job) -> Result<()> {
        if !job.is_async() {
            return Ok(());
        }
        let update = TaskUpdate::for_job(job, &self.config.target, &self.config.host);
        let mut attempt = 1;
        loop {
            match self.remote.publish_update(&job.pubsub_topic, &update).await {
                Ok(()) => return Ok(()),
                Err(e @ tryjobs_core::Error::Transport(_)) if attempt < PUBLISH_ATTEMPTS => {
                    warn!(job_id = %job.id, attempt, error = %e, "Pub/Sub publish failed; retrying");
                    tokio::time::sleep(PUBLISH_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(IntegratorError::from(e).for_job(job)),
            }
        }
    }
}

pub(crate) fn expiration_after(lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Run `tick` every `period` until `shutdown` fires. Each tick runs in its
/// own task, so shutdown never abandons a half-finished batch.
pub(crate) async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut liveness = Liveness::new(name);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match tokio::spawn(tick()).await {
            Ok(Ok(())) => liveness.reset(),
            Ok(Err(e)) => error!(
                task = liveness.name(),
                errors = e.count(),
                since_success = ?liveness.age(),
                error = %e,
                "Periodic task failed"
            ),
            Err(e) => error!(task = liveness.name(), error = %e, "Periodic task panicked"),
        }
    }
    info!(task = name, "Periodic task stopped");
}
