//! Finds remote builds stuck in STARTED and settles them.

use chrono::Utc;
use tracing::{error, info, warn};
use tryjobs_core::remote::{Build, BuildPredicate, BuildStatus, is_build_already_finished};

use crate::error::{IntegratorError, Result};
use crate::integrator::TryJobIntegrator;

const NO_TOKEN_REASON: &str = "We no longer have an update token for this build";
const UPDATE_FAILED_REASON: &str = "Failed to UpdateBuild";

impl TryJobIntegrator {
    /// Settle builds in the bucket that have been STARTED for longer than
    /// the cleanup age although their local job has finished.
    pub async fn cleanup(&self) -> Result<()> {
        let age = chrono::Duration::from_std(self.config.cleanup_age)
            .map_err(|e| IntegratorError::Invariant(format!("cleanup age: {}", e)))?;
        let builds = self
            .remote
            .search(&BuildPredicate {
                project: self.config.project.clone(),
                bucket: self.config.bucket.clone(),
                status: BuildStatus::Started,
                created_before: Utc::now() - age,
            })
            .await?;

        let mut errs = Vec::new();
        for build in &builds {
            if build.builder.bucket != self.config.bucket {
                info!(
                    build_id = build.id,
                    bucket = %build.builder.bucket,
                    "Cleanup: ignoring build from another bucket"
                );
                continue;
            }
            if let Err(e) = self.cleanup_build(build).await {
                errs.push(e.for_build(build.id));
            }
        }
        IntegratorError::collect(errs)
    }

    async fn cleanup_build(&self, build: &Build) -> Result<()> {
        // Nothing useful can be done without a local job.
        let Some(job) = self.find_job_for_build(build.id).await? else {
            return Ok(());
        };
        if !job.done() {
            return Ok(());
        }

        if job.update_token.is_empty() {
            error!(job_id = %job.id, build_id = build.id, "Cleanup: job no longer has an update token; canceling the build");
            return self.cancel_build(&job, NO_TOKEN_REASON).await;
        }

        info!(job_id = %job.id, build_id = build.id, "Cleanup: attempting to update build");
        match self.update_build(&job, &job.update_token).await {
            Ok(()) => Ok(()),
            Err(IntegratorError::Remote(e)) if is_build_already_finished(&e) => {
                warn!(job_id = %job.id, build_id = build.id, "Cleanup: tried to update already-finished build");
                Ok(())
            }
            Err(e) => {
                error!(job_id = %job.id, build_id = build.id, error = %e, "Cleanup: failed to update build; canceling");
                self.cancel_build(&job, UPDATE_FAILED_REASON).await
            }
        }
    }
}
