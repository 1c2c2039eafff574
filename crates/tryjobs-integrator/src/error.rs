//! Integrator error types.

use thiserror::Error;
use tryjobs_core::remote::Rejection;
use tryjobs_core::{Job, JobId};
use tryjobs_db::DbError;

#[derive(Debug, Error)]
pub enum IntegratorError {
    #[error(transparent)]
    Remote(#[from] tryjobs_core::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    /// Structured rejection from the remote service.
    #[error("build {build_id} rejected: {rejection}")]
    Rejected { build_id: i64, rejection: Rejection },

    /// A lease-expired heartbeat whose re-lease also failed.
    #[error("build {build_id}: heartbeat rejected with {rejection} and re-lease failed: {source}")]
    ReleaseFailed {
        build_id: i64,
        rejection: Rejection,
        #[source]
        source: Box<IntegratorError>,
    },

    /// The job could not be prepared to run. Never retried.
    #[error("{0}")]
    Invalid(String),

    /// A broken assumption about the remote protocol or local state.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("job {job_id} (build {build_id}): {source}")]
    Job {
        job_id: JobId,
        build_id: i64,
        #[source]
        source: Box<IntegratorError>,
    },

    #[error("build {build_id}: {source}")]
    Build {
        build_id: i64,
        #[source]
        source: Box<IntegratorError>,
    },

    #[error("{} errors: [{}]", .0.len(), .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<IntegratorError>),
}

impl IntegratorError {
    pub fn for_job(self, job: &Job) -> Self {
        IntegratorError::Job {
            job_id: job.id,
            build_id: job.build_id,
            source: Box::new(self),
        }
    }

    pub fn for_build(self, build_id: i64) -> Self {
        IntegratorError::Build {
            build_id,
            source: Box::new(self),
        }
    }

    /// Collapse the errors of a batch loop. Empty means success.
    pub fn collect(mut errs: Vec<IntegratorError>) -> Result<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(IntegratorError::Aggregate(errs)),
        }
    }

    /// Number of leaf errors.
    pub fn count(&self) -> usize {
        match self {
            IntegratorError::Aggregate(errs) => errs.iter().map(IntegratorError::count).sum(),
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, IntegratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect() {
        assert!(IntegratorError::collect(vec![]).is_ok());

        let one = IntegratorError::collect(vec![IntegratorError::Invalid("bad".into())]).unwrap_err();
        assert_eq!(one.to_string(), "bad");
        assert_eq!(one.count(), 1);

        let many = IntegratorError::collect(vec![
            IntegratorError::Invalid("a".into()),
            IntegratorError::Invalid("b".into()).for_build(7),
        ])
        .unwrap_err();
        assert_eq!(many.count(), 2);
        assert_eq!(many.to_string(), "2 errors: [a; build 7: b]");
    }
}
