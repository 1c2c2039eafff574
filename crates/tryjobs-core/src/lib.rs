//! Core domain types and traits for the try job integrator.
//!
//! This crate contains:
//! - Job identifiers, jobs and repo states
//! - Task configuration and dependency graph computation
//! - Remote build service types and the `RemoteBuildService` trait
//! - Collaborator traits (code review, repo resolution, task config cache)

pub mod error;
pub mod id;
pub mod job;
pub mod remote;
pub mod review;
pub mod task_cfg;

pub use error::{Error, Result};
pub use id::JobId;
pub use job::{Job, JobStatus, Patch, RemoteHandle, RepoState};

/// Truncate `s` to at most `max` bytes without splitting a character.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // "é" is two bytes; never split it.
        assert_eq!(truncate("héllo", 2), "h");
    }
}
