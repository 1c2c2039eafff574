//! In-memory job database, for tests and local development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc};
use tryjobs_core::{Job, JobId};

use crate::{DbError, DbResult, JobDb, JobSearchParams};

const MODIFIED_JOBS_BUFFER: usize = 100;

#[derive(Default)]
pub struct InMemoryJobDb {
    jobs: RwLock<HashMap<JobId, Job>>,
    subscribers: Mutex<Vec<mpsc::Sender<Vec<Job>>>>,
    fail_puts: AtomicBool,
}

impl InMemoryJobDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobDb for InMemoryJobDb {
    async fn get(&self, id: JobId) -> DbResult<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn search(&self, params: &JobSearchParams) -> DbResult<Vec<Job>> {
        let mut found: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| params.matches(j))
            .cloned()
            .collect();
        found.sort_by_key(|j| j.created);
        Ok(found)
    }

    async fn put_batch(&self, jobs: &[Job]) -> DbResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(DbError::WriteFailed("writes disabled".to_string()));
        }
        if jobs.is_empty() {
            return Ok(());
        }
        {
            let mut stored = self.jobs.write().await;
            for job in jobs {
                stored.insert(job.id, job.clone());
            }
        }

        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| match tx.try_send(jobs.to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    async fn modified_jobs(&self) -> DbResult<mpsc::Receiver<Vec<Job>>> {
        let (tx, rx) = mpsc::channel(MODIFIED_JOBS_BUFFER);
        self.subscribers.lock().await.push(tx);
        Ok(rx)
    }
}
