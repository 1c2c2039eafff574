//! Repo states the integrator refuses to run.

use tryjobs_config::SkipRepoState;
use tryjobs_core::RepoState;

pub trait RepoStateFilter: Send + Sync {
    /// Whether jobs for this repo state should be dropped.
    fn skip(&self, rs: &RepoState) -> bool;
}

/// Fixed list of issue/patchset pairs, e.g. patches against an invalid hash.
#[derive(Debug, Clone, Default)]
pub struct SkipList {
    entries: Vec<SkipRepoState>,
}

impl SkipList {
    pub fn new(entries: Vec<SkipRepoState>) -> Self {
        Self { entries }
    }
}

impl RepoStateFilter for SkipList {
    fn skip(&self, rs: &RepoState) -> bool {
        self.entries
            .iter()
            .any(|e| e.issue == rs.patch.issue && e.patchset == rs.patch.patchset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tryjobs_core::Patch;

    #[test]
    fn test_skip_list() {
        let list = SkipList::new(vec![SkipRepoState {
            issue: "527502".to_string(),
            patchset: "1".to_string(),
        }]);
        let mut rs = RepoState {
            repo: "https://skia.googlesource.com/skia.git".to_string(),
            revision: "abc123".to_string(),
            patch: Patch {
                server: "https://skia-review.googlesource.com".to_string(),
                issue: "527502".to_string(),
                patchset: "1".to_string(),
                patch_repo: "https://skia.googlesource.com/skia.git".to_string(),
            },
        };
        assert!(list.skip(&rs));
        rs.patch.patchset = "2".to_string();
        assert!(!list.skip(&rs));
        assert!(!SkipList::default().skip(&rs));
    }
}
