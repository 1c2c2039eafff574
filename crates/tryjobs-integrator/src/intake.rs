//! Discovers scheduled remote builds and creates local jobs for them.

use futures::future::join_all;
use tracing::{error, info, warn};
use tryjobs_core::remote::{BuildStatus, RejectionReason};
use tryjobs_core::{Job, Patch, RepoState};

use crate::error::{IntegratorError, Result};
use crate::integrator::TryJobIntegrator;

impl TryJobIntegrator {
    /// Page through the pending builds in the bucket and create a job for
    /// each one we don't know about yet.
    pub async fn poll(&self) -> Result<()> {
        self.cache.update().await?;

        let bucket = &self.config.bucket;
        let mut errs = Vec::new();
        let mut cursor = String::new();
        loop {
            info!(bucket = %bucket, "Running peek");
            let page = match self
                .remote
                .peek(bucket, self.config.peek_max_builds, &cursor)
                .await
            {
                Ok(Ok(page)) => page,
                Ok(Err(rejection)) => {
                    errs.push(IntegratorError::Invalid(format!(
                        "peek on {} rejected: {}",
                        bucket, rejection
                    )));
                    break;
                }
                Err(e) => {
                    errs.push(e.into());
                    break;
                }
            };

            let results = join_all(page.build_ids.iter().map(|&id| async move {
                self.insert_new_job(id)
                    .await
                    .map_err(|e| e.for_build(id))
            }))
            .await;
            errs.extend(results.into_iter().filter_map(|r| r.err()));

            if page.next_cursor.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }

        IntegratorError::collect(errs)
    }

    /// Create and lease a job for one pending build. Builds with bad input
    /// are canceled remotely since retrying cannot fix them.
    pub(crate) async fn insert_new_job(&self, build_id: i64) -> Result<()> {
        // Racing pollers can still both get past this check.
        if let Some(existing) = self.find_job_for_build(build_id).await? {
            info!(build_id, job_id = %existing.id, "Found existing job for build; ignoring");
            return Ok(());
        }

        info!(build_id, "Creating job for build");
        let build = self.remote.get_build(build_id).await?;
        if build.status != BuildStatus::Scheduled {
            warn!(
                build_id,
                status = ?build.status,
                "Build is not scheduled; attempting to lease anyway to nudge the remote service"
            );
            if !matches!(self.lease(build_id).await, Ok(Ok(_))) {
                // Expected.
                return Ok(());
            }
            warn!(build_id, status = ?build.status, "Unexpectedly able to lease build; canceling it");
            if let Err(e) = self
                .remote_cancel_legacy(build_id, &format!("Unexpected status {:?}", build.status))
                .await
            {
                warn!(build_id, error = %e, "Failed to cancel errant build");
            }
            return Ok(());
        }

        let [change] = build.gerrit_changes.as_slice() else {
            return self
                .remote_cancel_legacy(
                    build_id,
                    &format!(
                        "Invalid build {}: input should have exactly one Gerrit change, found {}",
                        build_id,
                        build.gerrit_changes.len()
                    ),
                )
                .await;
        };
        let Some(repo) = self.config.project_repos.get(&change.project) else {
            return self
                .remote_cancel_legacy(
                    build_id,
                    &format!("Unknown patch project {:?}", change.project),
                )
                .await;
        };

        let server = if change.host.contains("://") {
            change.host.clone()
        } else {
            format!("https://{}", change.host)
        };
        let rs = RepoState {
            repo: repo.clone(),
            // Resolved from the change's branch when the job starts.
            revision: String::new(),
            patch: Patch {
                server,
                issue: change.change.to_string(),
                patchset: change.patchset.to_string(),
                patch_repo: repo.clone(),
            },
        };
        if self.filter.skip(&rs) {
            info!(build_id, repo_state = %rs, "Skipping denylisted repo state");
            return Ok(());
        }

        let mut job = Job::new_requested(&build.builder.builder, build_id, rs, build.create_time);
        if job.requested >= job.created {
            error!(
                build_id,
                requested = %job.requested,
                created = %job.created,
                "Build requested time is not before job creation; clamping"
            );
            job.requested = job.created - chrono::Duration::microseconds(1);
        }

        match self.lease(build_id).await? {
            Ok(0) => {
                return self
                    .remote_cancel_legacy(build_id, "Remote service returned zero lease key")
                    .await;
            }
            Ok(key) => job.lease_key = key,
            Err(rejection) if rejection.reason == RejectionReason::InvalidInput => {
                // Async builds reach us through a different flow.
                warn!(build_id, "Failed to lease build; is this an async build?");
                return Ok(());
            }
            Err(rejection) => {
                return self
                    .remote_cancel_legacy(
                        build_id,
                        &format!(
                            "Remote service refused lease with {:?} ({})",
                            rejection.message,
                            rejection.reason.as_str()
                        ),
                    )
                    .await;
            }
        }

        info!(build_id, job_id = %job.id, "Inserting new job");
        if let Err(e) = self.db.put(&job).await {
            return self
                .remote_cancel_legacy(build_id, &format!("Failed to insert job into the DB: {}", e))
                .await;
        }
        self.cache.add(std::slice::from_ref(&job)).await;
        info!(build_id, job_id = %job.id, "Created job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, SKIA_REPO, scheduled_build};
    use tryjobs_config::SkipRepoState;
    use tryjobs_core::JobStatus;
    use tryjobs_core::remote::{PeekPage, Rejection};
    use tryjobs_db::{JobCache, JobDb};

    #[tokio::test]
    async fn test_intake_creates_leased_job() {
        let f = Fixture::new();
        f.remote.add_build(scheduled_build(42, "skia"));
        f.remote.push_lease(Ok(Ok(7)));
        f.remote.push_peek(Ok(Ok(PeekPage {
            build_ids: vec![42],
            next_cursor: String::new(),
        })));

        f.integrator.poll().await.unwrap();

        let jobs = f.db.all().await;
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.build_id, 42);
        assert_eq!(job.lease_key, 7);
        assert_eq!(job.status, JobStatus::Requested);
        assert_eq!(job.name, "my-builder");
        assert_eq!(job.repo_state.repo, SKIA_REPO);
        assert_eq!(job.repo_state.revision, "");
        assert_eq!(job.repo_state.patch.server, "https://skia-review.googlesource.com");
        assert_eq!(job.repo_state.patch.issue, "123");
        assert_eq!(job.repo_state.patch.patchset, "4");
        assert!(job.requested < job.created);
        assert_eq!(f.cache.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_intake_pages_through_cursor() {
        let f = Fixture::new();
        for id in [1, 2, 3] {
            f.remote.add_build(scheduled_build(id, "skia"));
        }
        f.remote.push_peek(Ok(Ok(PeekPage {
            build_ids: vec![1, 2],
            next_cursor: "next".to_string(),
        })));
        f.remote.push_peek(Ok(Ok(PeekPage {
            build_ids: vec![3],
            next_cursor: String::new(),
        })));

        f.integrator.poll().await.unwrap();
        assert_eq!(f.db.len().await, 3);
        assert_eq!(f.remote.peek_cursors(), vec!["".to_string(), "next".to_string()]);
    }

    #[tokio::test]
    async fn test_intake_skips_existing_job() {
        let f = Fixture::new();
        f.remote.add_build(scheduled_build(42, "skia"));
        f.integrator.insert_new_job(42).await.unwrap();
        f.integrator.insert_new_job(42).await.unwrap();
        assert_eq!(f.db.len().await, 1);
        assert_eq!(f.remote.leases(), vec![42]);
    }

    #[tokio::test]
    async fn test_intake_unknown_project_cancels_build() {
        let f = Fixture::new();
        f.remote.add_build(scheduled_build(42, "unknown-project"));

        f.integrator.insert_new_job(42).await.unwrap();

        assert!(f.db.is_empty().await);
        assert!(f.remote.leases().is_empty());
        let cancels = f.remote.legacy_cancels();
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].0, 42);
        assert!(cancels[0].1.contains("Unknown patch project"));
    }

    #[tokio::test]
    async fn test_intake_requires_one_change() {
        let f = Fixture::new();
        let mut build = scheduled_build(42, "skia");
        build.gerrit_changes.push(build.gerrit_changes[0].clone());
        f.remote.add_build(build);

        f.integrator.insert_new_job(42).await.unwrap();
        assert!(f.db.is_empty().await);
        assert!(f.remote.legacy_cancels()[0].1.contains("exactly one Gerrit change"));
    }

    #[tokio::test]
    async fn test_intake_ignores_async_builds() {
        let f = Fixture::new();
        f.remote.add_build(scheduled_build(42, "skia"));
        f.remote.push_lease(Ok(Err(Rejection::new(
            RejectionReason::InvalidInput,
            "not a legacy build",
        ))));

        f.integrator.insert_new_job(42).await.unwrap();
        assert!(f.db.is_empty().await);
        assert!(f.remote.legacy_cancels().is_empty());
    }

    #[tokio::test]
    async fn test_intake_refused_lease_cancels() {
        let f = Fixture::new();
        f.remote.add_build(scheduled_build(42, "skia"));
        f.remote.push_lease(Ok(Err(Rejection::new(
            RejectionReason::BuildIsCompleted,
            "canceled",
        ))));

        f.integrator.insert_new_job(42).await.unwrap();
        assert!(f.db.is_empty().await);
        assert!(f.remote.legacy_cancels()[0].1.contains("refused lease"));
    }

    #[tokio::test]
    async fn test_intake_zero_lease_key_cancels() {
        let f = Fixture::new();
        f.remote.add_build(scheduled_build(42, "skia"));
        f.remote.push_lease(Ok(Ok(0)));

        f.integrator.insert_new_job(42).await.unwrap();
        assert!(f.db.is_empty().await);
        assert_eq!(f.remote.legacy_cancels().len(), 1);
    }

    #[tokio::test]
    async fn test_intake_db_failure_cancels() {
        let f = Fixture::new();
        f.remote.add_build(scheduled_build(42, "skia"));
        f.db.set_fail_puts(true);

        f.integrator.insert_new_job(42).await.unwrap();
        assert!(f.remote.legacy_cancels()[0].1.contains("Failed to insert job"));
    }

    #[tokio::test]
    async fn test_intake_lease_transport_error_is_per_build() {
        let f = Fixture::new();
        f.remote.add_build(scheduled_build(1, "skia"));
        f.remote.add_build(scheduled_build(2, "skia"));
        f.remote
            .push_lease(Err(tryjobs_core::Error::Transport("timeout".into())));
        f.remote.push_peek(Ok(Ok(PeekPage {
            build_ids: vec![1, 2],
            next_cursor: String::new(),
        })));

        let err = f.integrator.poll().await.unwrap_err();
        assert_eq!(err.count(), 1);
        assert!(err.to_string().contains("timeout"));
        // The other build was still created.
        assert_eq!(f.db.len().await, 1);
    }

    #[tokio::test]
    async fn test_intake_nudges_unscheduled_build() {
        let f = Fixture::new();
        let mut build = scheduled_build(42, "skia");
        build.status = BuildStatus::Started;
        f.remote.add_build(build);

        // Lease refused: the expected outcome.
        f.remote.push_lease(Ok(Err(Rejection::new(
            RejectionReason::LeaseExpired,
            "nope",
        ))));
        f.integrator.insert_new_job(42).await.unwrap();
        assert!(f.remote.legacy_cancels().is_empty());

        // Lease granted: cancel the errant build.
        f.remote.push_lease(Ok(Ok(9)));
        f.integrator.insert_new_job(42).await.unwrap();
        assert!(f.remote.legacy_cancels()[0].1.contains("Unexpected status"));
        assert!(f.db.is_empty().await);
    }

    #[tokio::test]
    async fn test_intake_skips_denylisted_repo_state() {
        let mut f = Fixture::new();
        f.config.skip_repo_states.push(SkipRepoState {
            issue: "123".to_string(),
            patchset: "4".to_string(),
        });
        f.rebuild();
        f.remote.add_build(scheduled_build(42, "skia"));

        f.integrator.insert_new_job(42).await.unwrap();
        assert!(f.db.is_empty().await);
        assert!(f.remote.leases().is_empty());
        assert!(f.remote.legacy_cancels().is_empty());
    }

    #[tokio::test]
    async fn test_intake_peek_rejection_is_reported() {
        let f = Fixture::new();
        f.remote.push_peek(Ok(Err(Rejection::new(
            RejectionReason::Other("FORBIDDEN".to_string()),
            "no access",
        ))));
        let err = f.integrator.poll().await.unwrap_err();
        assert!(err.to_string().contains("no access"));
        assert!(f.db.search(&Default::default()).await.unwrap().is_empty());
    }
}
