//! Task configuration and the dependency graph of a job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::{Error, RepoState, Result};

/// A single task definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A named job: the set of tasks it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "tasks", default)]
    pub task_specs: Vec<String>,
}

/// The task configuration of a repo state (`tasks.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCfg {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobSpec>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskSpec>,
}

impl TaskCfg {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("failed to parse task config: {}", e)))
    }
}

impl JobSpec {
    /// Compute the dependency graph reachable from this job's tasks,
    /// mapping each task to its direct dependencies.
    pub fn task_dag(&self, cfg: &TaskCfg) -> Result<BTreeMap<String, Vec<String>>> {
        let mut dag = BTreeMap::new();
        let mut queue: Vec<&str> = self.task_specs.iter().map(String::as_str).collect();

        while let Some(name) = queue.pop() {
            if dag.contains_key(name) {
                continue;
            }
            let spec = cfg
                .tasks
                .get(name)
                .ok_or_else(|| Error::InvalidInput(format!("no such task: {}", name)))?;
            dag.insert(name.to_string(), spec.dependencies.clone());
            queue.extend(spec.dependencies.iter().map(String::as_str));
        }

        if let Some(cycle) = detect_cycle(&dag) {
            return Err(Error::InvalidInput(format!(
                "cycle detected in task dependencies: {}",
                cycle
            )));
        }
        Ok(dag)
    }
}

fn detect_cycle(dag: &BTreeMap<String, Vec<String>>) -> Option<String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    for name in dag.keys() {
        if !visited.contains_key(name.as_str()) {
            if let Some(cycle) = dfs_detect_cycle(name, dag, &mut visited, &mut rec_stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    dag: &'a BTreeMap<String, Vec<String>>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(deps) = dag.get(node) {
        for dep in deps {
            let dep = dep.as_str();
            if !visited.contains_key(dep) {
                if let Some(cycle) = dfs_detect_cycle(dep, dag, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}

/// Cache of task configurations keyed by repo state.
///
/// Both operations can be slow (they may sync a repository), so
/// implementations are expected to cache results.
#[async_trait]
pub trait TaskCfgCache: Send + Sync {
    /// Make sure the repo state has been synced and its config cached.
    async fn get_or_cache_repo_state(&self, rs: &RepoState) -> Result<()>;

    /// Get the task configuration for a repo state. A permanent failure
    /// recorded for the repo state is returned as `Error::CachedConfig`.
    async fn get(&self, rs: &RepoState) -> Result<TaskCfg>;
}
