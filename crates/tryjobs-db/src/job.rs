//! Job database trait and PostgreSQL implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tryjobs_core::{Job, JobId, JobStatus, Patch, RepoState};

use crate::{DbError, DbResult};

/// Postgres channel carrying the ids of inserted or updated jobs.
const JOBS_MODIFIED_CHANNEL: &str = "jobs_modified";

/// Capacity of the modified-jobs channel handed to subscribers.
const MODIFIED_JOBS_BUFFER: usize = 100;

/// Filters for `JobDb::search`. Time bounds apply to the job's `created`
/// timestamp; `time_end` is exclusive.
#[derive(Debug, Clone, Default)]
pub struct JobSearchParams {
    pub build_id: Option<i64>,
    pub name: Option<String>,
    pub status: Option<JobStatus>,
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
}

impl JobSearchParams {
    pub fn matches(&self, job: &Job) -> bool {
        self.build_id.is_none_or(|id| job.build_id == id)
            && self.name.as_deref().is_none_or(|n| job.name == n)
            && self.status.is_none_or(|s| job.status == s)
            && self.time_start.is_none_or(|t| job.created >= t)
            && self.time_end.is_none_or(|t| job.created < t)
    }
}

#[async_trait]
pub trait JobDb: Send + Sync {
    async fn get(&self, id: JobId) -> DbResult<Job>;

    async fn search(&self, params: &JobSearchParams) -> DbResult<Vec<Job>>;

    /// Insert or update jobs. Each job is written atomically; the batch
    /// as a whole is not.
    async fn put_batch(&self, jobs: &[Job]) -> DbResult<()>;

    async fn put(&self, job: &Job) -> DbResult<()> {
        self.put_batch(std::slice::from_ref(job)).await
    }

    async fn scan_by_status(&self, status: JobStatus) -> DbResult<Vec<Job>> {
        self.search(&JobSearchParams {
            status: Some(status),
            ..Default::default()
        })
        .await
    }

    /// Subscribe to batches of jobs as they are inserted or modified.
    async fn modified_jobs(&self) -> DbResult<mpsc::Receiver<Vec<Job>>>;
}

/// A job row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRecord {
    id: uuid::Uuid,
    name: String,
    build_id: i64,
    lease_key: i64,
    update_token: String,
    pubsub_topic: String,
    repo: String,
    revision: String,
    patch: serde_json::Value,
    status: String,
    status_details: String,
    is_force: bool,
    dependencies: serde_json::Value,
    requested: DateTime<Utc>,
    created: DateTime<Utc>,
    finished: Option<DateTime<Utc>>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(r: JobRecord) -> DbResult<Self> {
        let patch: Patch = serde_json::from_value(r.patch)
            .map_err(|e| DbError::InvalidRecord(format!("job {} patch: {}", r.id, e)))?;
        let dependencies: BTreeMap<String, Vec<String>> = serde_json::from_value(r.dependencies)
            .map_err(|e| DbError::InvalidRecord(format!("job {} dependencies: {}", r.id, e)))?;
        let status = r
            .status
            .parse()
            .map_err(|e| DbError::InvalidRecord(format!("job {}: {}", r.id, e)))?;

        Ok(Job {
            id: JobId::from_uuid(r.id),
            name: r.name,
            build_id: r.build_id,
            lease_key: r.lease_key,
            update_token: r.update_token,
            pubsub_topic: r.pubsub_topic,
            repo_state: RepoState {
                repo: r.repo,
                revision: r.revision,
                patch,
            },
            status,
            status_details: r.status_details,
            is_force: r.is_force,
            dependencies,
            requested: r.requested,
            created: r.created,
            finished: r.finished,
        })
    }
}

/// PostgreSQL implementation of JobDb.
pub struct PgJobDb {
    pool: PgPool,
}

impl PgJobDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn put_one(&self, job: &Job) -> DbResult<()> {
        let patch = serde_json::to_value(&job.repo_state.patch)
            .map_err(|e| DbError::InvalidRecord(e.to_string()))?;
        let dependencies = serde_json::to_value(&job.dependencies)
            .map_err(|e| DbError::InvalidRecord(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, build_id, lease_key, update_token, pubsub_topic,
                              repo, revision, patch, status, status_details, is_force,
                              dependencies, requested, created, finished)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                build_id = EXCLUDED.build_id,
                lease_key = EXCLUDED.lease_key,
                update_token = EXCLUDED.update_token,
                pubsub_topic = EXCLUDED.pubsub_topic,
                repo = EXCLUDED.repo,
                revision = EXCLUDED.revision,
                patch = EXCLUDED.patch,
                status = EXCLUDED.status,
                status_details = EXCLUDED.status_details,
                is_force = EXCLUDED.is_force,
                dependencies = EXCLUDED.dependencies,
                requested = EXCLUDED.requested,
                finished = EXCLUDED.finished
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(job.build_id)
        .bind(job.lease_key)
        .bind(&job.update_token)
        .bind(&job.pubsub_topic)
        .bind(&job.repo_state.repo)
        .bind(&job.repo_state.revision)
        .bind(patch)
        .bind(job.status.as_str())
        .bind(&job.status_details)
        .bind(job.is_force)
        .bind(dependencies)
        .bind(job.requested)
        .bind(job.created)
        .bind(job.finished)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobDb for PgJobDb {
    async fn get(&self, id: JobId) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        record.try_into()
    }

    async fn search(&self, params: &JobSearchParams) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE ($1::BIGINT IS NULL OR build_id = $1)
              AND ($2::TEXT IS NULL OR name = $2)
              AND ($3::TEXT IS NULL OR status = $3)
              AND ($4::TIMESTAMPTZ IS NULL OR created >= $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created < $5)
            ORDER BY created
            "#,
        )
        .bind(params.build_id)
        .bind(params.name.as_deref())
        .bind(params.status.map(|s| s.as_str()))
        .bind(params.time_start)
        .bind(params.time_end)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Job::try_from).collect()
    }

    async fn put_batch(&self, jobs: &[Job]) -> DbResult<()> {
        for job in jobs {
            self.put_one(job).await?;
        }
        Ok(())
    }

    async fn modified_jobs(&self) -> DbResult<mpsc::Receiver<Vec<Job>>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(JOBS_MODIFIED_CHANNEL).await?;

        let (tx, rx) = mpsc::channel(MODIFIED_JOBS_BUFFER);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let db = PgJobDb::new(pool);
            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "Modified jobs listener failed");
                        return;
                    }
                };
                let id = match notification.payload().parse::<JobId>() {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(payload = notification.payload(), error = %e, "Bad job id in notification");
                        continue;
                    }
                };
                let job = match db.get(id).await {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "Failed to load modified job");
                        continue;
                    }
                };
                if tx.send(vec![job]).await.is_err() {
                    debug!("Modified jobs subscriber went away");
                    return;
                }
            }
        });
        Ok(rx)
    }
}
