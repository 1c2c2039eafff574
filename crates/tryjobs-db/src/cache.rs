//! In-memory mirror of recent jobs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use tryjobs_core::{Job, JobId, RepoState};

use crate::{DbResult, JobDb, JobSearchParams};

/// Cache of jobs shared by every integrator component. Safe for
/// concurrent reads, inserts and updates; no lock is held across a
/// database call.
#[async_trait]
pub trait JobCache: Send + Sync {
    /// Resync from the database.
    async fn update(&self) -> DbResult<()>;

    async fn all(&self) -> Vec<Job>;

    /// Insert or replace jobs.
    async fn add(&self, jobs: &[Job]);

    /// Jobs with the given name and repo state.
    async fn by_repo_state(&self, name: &str, rs: &RepoState) -> Vec<Job>;
}

/// `JobCache` backed by a `JobDb`, holding jobs created within a
/// trailing window.
pub struct DbJobCache {
    db: Arc<dyn JobDb>,
    window: Duration,
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl DbJobCache {
    pub fn new(db: Arc<dyn JobDb>, window: Duration) -> Self {
        Self {
            db,
            window,
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl JobCache for DbJobCache {
    async fn update(&self) -> DbResult<()> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        let start = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let jobs = self
            .db
            .search(&JobSearchParams {
                time_start: Some(start),
                ..Default::default()
            })
            .await?;
        debug!(count = jobs.len(), "Job cache updated");

        let mut cached = self.jobs.write().await;
        cached.clear();
        cached.extend(jobs.into_iter().map(|j| (j.id, j)));
        Ok(())
    }

    async fn all(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }

    async fn add(&self, jobs: &[Job]) {
        let mut cached = self.jobs.write().await;
        for job in jobs {
            cached.insert(job.id, job.clone());
        }
    }

    async fn by_repo_state(&self, name: &str, rs: &RepoState) -> Vec<Job> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.name == name && j.repo_state == *rs)
            .cloned()
            .collect()
    }
}
