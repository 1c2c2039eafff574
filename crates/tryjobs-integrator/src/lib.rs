//! The try job integrator.
//!
//! Keeps the local job database and the remote build service in
//! agreement:
//! - Intake: poll the bucket for scheduled builds and create leased jobs
//! - Starter: resolve requested jobs and move them to in-progress
//! - Heartbeats: renew legacy leases and publish async progress
//! - Reconciler: report terminal jobs and drop their credentials
//! - Cleanup: settle builds left STARTED after their job finished

mod cleanup;
pub mod denylist;
pub mod error;
mod heartbeat;
mod intake;
pub mod integrator;
pub mod liveness;
mod reconcile;
mod starter;

#[cfg(test)]
mod testing;

pub use denylist::{RepoStateFilter, SkipList};
pub use error::{IntegratorError, Result};
pub use integrator::{Collaborators, MAX_DETAILS_LEN, TryJobIntegrator};
pub use liveness::Liveness;
