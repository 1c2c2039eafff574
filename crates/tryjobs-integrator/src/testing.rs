//! Test doubles for the integrator's collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tryjobs_config::IntegratorConfig;
use tryjobs_core::remote::{
    Build, BuildPredicate, BuildStatus, BuildUpdate, BuilderId, FailureReason, GerritChange,
    Heartbeat, PeekPage, Rejection, RemoteBuildService, RemoteReply, TaskUpdate,
};
use tryjobs_core::review::{CodeReview, RepoResolver};
use tryjobs_core::task_cfg::{JobSpec, TaskCfg, TaskCfgCache, TaskSpec};
use tryjobs_core::{Error, Job, Patch, RepoState, Result};
use tryjobs_db::{DbJobCache, InMemoryJobDb, JobCache, JobDb};

use crate::integrator::{Collaborators, TryJobIntegrator};

pub const SKIA_REPO: &str = "https://skia.googlesource.com/skia.git";
pub const BRANCH_HEAD: &str = "abc123";
const BUCKET: &str = "skia.primary";

/// A legacy try job for `build_id`, leased but not yet started.
pub fn try_job(build_id: i64) -> Job {
    let mut job = Job::new_requested(
        "my-builder",
        build_id,
        RepoState {
            repo: SKIA_REPO.to_string(),
            revision: String::new(),
            patch: Patch {
                server: "https://skia-review.googlesource.com".to_string(),
                issue: "123".to_string(),
                patchset: "4".to_string(),
                patch_repo: SKIA_REPO.to_string(),
            },
        },
        Utc::now() - chrono::Duration::seconds(10),
    );
    job.lease_key = 7;
    job
}

pub fn scheduled_build(id: i64, project: &str) -> Build {
    Build {
        id,
        builder: BuilderId {
            project: "skia".to_string(),
            bucket: BUCKET.to_string(),
            builder: "my-builder".to_string(),
        },
        status: BuildStatus::Scheduled,
        create_time: Utc::now() - chrono::Duration::minutes(1),
        gerrit_changes: vec![GerritChange {
            host: "skia-review.googlesource.com".to_string(),
            project: project.to_string(),
            change: 123,
            patchset: 4,
        }],
    }
}

pub struct Fixture {
    pub integrator: Arc<TryJobIntegrator>,
    pub db: Arc<InMemoryJobDb>,
    pub cache: Arc<DbJobCache>,
    pub remote: Arc<MockRemote>,
    pub task_cfg: Arc<MockTaskCfg>,
    pub config: IntegratorConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let config = IntegratorConfig {
            bucket: BUCKET.to_string(),
            host: "task-scheduler.skia.org".to_string(),
            target: "skia://tryjobs".to_string(),
            project_repos: BTreeMap::from([("skia".to_string(), SKIA_REPO.to_string())]),
            ..Default::default()
        };
        let db = Arc::new(InMemoryJobDb::new());
        let cache = Arc::new(DbJobCache::new(db.clone(), Duration::from_secs(24 * 60 * 60)));
        let remote = Arc::new(MockRemote::default());
        let task_cfg = Arc::new(MockTaskCfg::default());
        let integrator = Arc::new(TryJobIntegrator::new(
            config.clone(),
            Collaborators {
                db: db.clone(),
                cache: cache.clone(),
                remote: remote.clone(),
                review: Arc::new(MockReview),
                repos: Arc::new(MockRepos),
                task_cfg: task_cfg.clone(),
            },
        ));
        Self {
            integrator,
            db,
            cache,
            remote,
            task_cfg,
            config,
        }
    }

    /// Recreate the integrator after editing `config`.
    pub fn rebuild(&mut self) {
        self.integrator = Arc::new(TryJobIntegrator::new(
            self.config.clone(),
            Collaborators {
                db: self.db.clone(),
                cache: self.cache.clone(),
                remote: self.remote.clone(),
                review: Arc::new(MockReview),
                repos: Arc::new(MockRepos),
                task_cfg: self.task_cfg.clone(),
            },
        ));
    }

    pub async fn put(&self, jobs: &[Job]) {
        self.db.put_batch(jobs).await.unwrap();
        self.cache.add(jobs).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Peek(String),
    GetBuild(i64),
    Lease(i64),
    Start(i64),
    Heartbeat(Vec<i64>),
    Succeed(i64),
    Fail(i64, FailureReason),
    CancelLegacy(i64, String),
    UpdateBuild(i64, String),
    CancelBuild(i64, String),
    Search(BuildPredicate),
    Publish(String),
}

/// Scripted remote build service. Queued replies are consumed in order;
/// once a queue is empty every call succeeds with a default reply.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    payloads: Vec<(String, String)>,
    builds: HashMap<i64, Build>,
    search: Vec<Build>,
    peeks: VecDeque<Result<RemoteReply<PeekPage>>>,
    leases: VecDeque<Result<RemoteReply<i64>>>,
    starts: VecDeque<Result<RemoteReply<Option<String>>>>,
    heartbeats: VecDeque<Result<Vec<Option<Rejection>>>>,
    cancel_legacy: VecDeque<Result<RemoteReply<()>>>,
    update_build: VecDeque<Result<()>>,
    cancel_build: VecDeque<Result<()>>,
    publish: VecDeque<Result<()>>,
    terminal: HashMap<i64, Result<RemoteReply<()>>>,
}

impl MockRemote {
    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_build(&self, build: Build) {
        self.with(|s| s.builds.insert(build.id, build));
    }

    pub fn set_search(&self, builds: Vec<Build>) {
        self.with(|s| s.search = builds);
    }

    pub fn set_terminal_reply(&self, build_id: i64, reply: Result<RemoteReply<()>>) {
        self.with(|s| s.terminal.insert(build_id, reply));
    }

    pub fn push_peek(&self, reply: Result<RemoteReply<PeekPage>>) {
        self.with(|s| s.peeks.push_back(reply));
    }

    pub fn push_lease(&self, reply: Result<RemoteReply<i64>>) {
        self.with(|s| s.leases.push_back(reply));
    }

    pub fn push_start(&self, reply: Result<RemoteReply<Option<String>>>) {
        self.with(|s| s.starts.push_back(reply));
    }

    pub fn push_heartbeat(&self, reply: Result<Vec<Option<Rejection>>>) {
        self.with(|s| s.heartbeats.push_back(reply));
    }

    pub fn push_cancel_legacy(&self, reply: Result<RemoteReply<()>>) {
        self.with(|s| s.cancel_legacy.push_back(reply));
    }

    pub fn push_update_build(&self, reply: Result<()>) {
        self.with(|s| s.update_build.push_back(reply));
    }

    pub fn push_cancel_build(&self, reply: Result<()>) {
        self.with(|s| s.cancel_build.push_back(reply));
    }

    pub fn push_publish(&self, reply: Result<()>) {
        self.with(|s| s.publish.push_back(reply));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    fn select<T>(&self, f: impl Fn(&Call) -> Option<T>) -> Vec<T> {
        self.with(|s| s.calls.iter().filter_map(f).collect())
    }

    pub fn peek_cursors(&self) -> Vec<String> {
        self.select(|c| match c {
            Call::Peek(cursor) => Some(cursor.clone()),
            _ => None,
        })
    }

    pub fn leases(&self) -> Vec<i64> {
        self.select(|c| match c {
            Call::Lease(id) => Some(*id),
            _ => None,
        })
    }

    pub fn starts(&self) -> Vec<i64> {
        self.select(|c| match c {
            Call::Start(id) => Some(*id),
            _ => None,
        })
    }

    pub fn heartbeat_batches(&self) -> Vec<Vec<i64>> {
        self.select(|c| match c {
            Call::Heartbeat(ids) => Some(ids.clone()),
            _ => None,
        })
    }

    pub fn legacy_cancels(&self) -> Vec<(i64, String)> {
        self.select(|c| match c {
            Call::CancelLegacy(id, details) => Some((*id, details.clone())),
            _ => None,
        })
    }

    pub fn update_builds(&self) -> Vec<(i64, String)> {
        self.select(|c| match c {
            Call::UpdateBuild(id, token) => Some((*id, token.clone())),
            _ => None,
        })
    }

    pub fn async_cancels(&self) -> Vec<(i64, String)> {
        self.select(|c| match c {
            Call::CancelBuild(id, reason) => Some((*id, reason.clone())),
            _ => None,
        })
    }

    pub fn search_predicates(&self) -> Vec<BuildPredicate> {
        self.select(|c| match c {
            Call::Search(p) => Some(p.clone()),
            _ => None,
        })
    }

    /// Build ids of every publish attempt.
    pub fn publishes(&self) -> Vec<String> {
        self.select(|c| match c {
            Call::Publish(id) => Some(id.clone()),
            _ => None,
        })
    }

    /// Details JSON and job link of each succeed/fail call.
    pub fn terminal_payloads(&self) -> Vec<(String, String)> {
        self.with(|s| s.payloads.clone())
    }

    fn terminal(&self, call: Call, build_id: i64, details: &str, url: &str) -> Result<RemoteReply<()>> {
        self.with(|s| {
            s.calls.push(call);
            s.payloads.push((details.to_string(), url.to_string()));
            s.terminal.get(&build_id).cloned().unwrap_or(Ok(Ok(())))
        })
    }
}

#[async_trait]
impl RemoteBuildService for MockRemote {
    async fn peek(
        &self,
        _bucket: &str,
        _max_builds: usize,
        cursor: &str,
    ) -> Result<RemoteReply<PeekPage>> {
        self.with(|s| {
            s.calls.push(Call::Peek(cursor.to_string()));
            s.peeks.pop_front().unwrap_or(Ok(Ok(PeekPage::default())))
        })
    }

    async fn get_build(&self, build_id: i64) -> Result<Build> {
        self.with(|s| {
            s.calls.push(Call::GetBuild(build_id));
            s.builds
                .get(&build_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("build {}", build_id)))
        })
    }

    async fn lease(&self, build_id: i64, _expiration: DateTime<Utc>) -> Result<RemoteReply<i64>> {
        self.with(|s| {
            s.calls.push(Call::Lease(build_id));
            s.leases.pop_front().unwrap_or(Ok(Ok(7)))
        })
    }

    async fn start(&self, job: &Job, _url: &str) -> Result<RemoteReply<Option<String>>> {
        self.with(|s| {
            s.calls.push(Call::Start(job.build_id));
            s.starts.pop_front().unwrap_or(Ok(Ok(None)))
        })
    }

    async fn heartbeat(&self, batch: &[Heartbeat]) -> Result<Vec<Option<Rejection>>> {
        self.with(|s| {
            s.calls
                .push(Call::Heartbeat(batch.iter().map(|h| h.build_id).collect()));
            s.heartbeats
                .pop_front()
                .unwrap_or_else(|| Ok(vec![None; batch.len()]))
        })
    }

    async fn succeed(&self, job: &Job, details_json: &str, url: &str) -> Result<RemoteReply<()>> {
        self.terminal(Call::Succeed(job.build_id), job.build_id, details_json, url)
    }

    async fn fail(
        &self,
        job: &Job,
        reason: FailureReason,
        details_json: &str,
        url: &str,
    ) -> Result<RemoteReply<()>> {
        self.terminal(Call::Fail(job.build_id, reason), job.build_id, details_json, url)
    }

    async fn cancel_legacy(&self, build_id: i64, details_json: &str) -> Result<RemoteReply<()>> {
        self.with(|s| {
            s.calls
                .push(Call::CancelLegacy(build_id, details_json.to_string()));
            s.cancel_legacy.pop_front().unwrap_or(Ok(Ok(())))
        })
    }

    async fn update_build(&self, update: &BuildUpdate, token: &str) -> Result<()> {
        self.with(|s| {
            s.calls
                .push(Call::UpdateBuild(update.build_id, token.to_string()));
            s.update_build.pop_front().unwrap_or(Ok(()))
        })
    }

    async fn cancel_build(&self, build_id: i64, reason: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::CancelBuild(build_id, reason.to_string()));
            s.cancel_build.pop_front().unwrap_or(Ok(()))
        })
    }

    async fn search(&self, predicate: &BuildPredicate) -> Result<Vec<Build>> {
        self.with(|s| {
            s.calls.push(Call::Search(predicate.clone()));
            Ok(s.search.clone())
        })
    }

    async fn publish_update(&self, _topic: &str, update: &TaskUpdate) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::Publish(update.build_id.clone()));
            s.publish.pop_front().unwrap_or(Ok(()))
        })
    }
}

pub struct MockReview;

#[async_trait]
impl CodeReview for MockReview {
    async fn change_branch(&self, _issue: i64) -> Result<String> {
        Ok("main".to_string())
    }
}

/// Knows the skia repo, whose `main` branch points at `BRANCH_HEAD`.
pub struct MockRepos;

#[async_trait]
impl RepoResolver for MockRepos {
    fn knows_repo(&self, repo: &str) -> bool {
        repo == SKIA_REPO
    }

    async fn resolve(&self, _repo: &str, reference: &str) -> Result<Option<String>> {
        Ok(match reference {
            "main" | BRANCH_HEAD => Some(BRANCH_HEAD.to_string()),
            _ => None,
        })
    }
}

pub struct MockTaskCfg {
    cfg: TaskCfg,
    error: Mutex<Option<Error>>,
}

impl Default for MockTaskCfg {
    fn default() -> Self {
        let cfg = TaskCfg {
            jobs: BTreeMap::from([(
                "my-builder".to_string(),
                JobSpec {
                    task_specs: vec!["test".to_string()],
                },
            )]),
            tasks: BTreeMap::from([
                ("build".to_string(), TaskSpec::default()),
                (
                    "test".to_string(),
                    TaskSpec {
                        dependencies: vec!["build".to_string()],
                    },
                ),
            ]),
        };
        Self {
            cfg,
            error: Mutex::new(None),
        }
    }
}

impl MockTaskCfg {
    /// Make every lookup fail with `err`.
    pub fn set_error(&self, err: Error) {
        *self.error.lock().unwrap() = Some(err);
    }
}

#[async_trait]
impl TaskCfgCache for MockTaskCfg {
    async fn get_or_cache_repo_state(&self, _rs: &RepoState) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _rs: &RepoState) -> Result<TaskCfg> {
        match self.error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(self.cfg.clone()),
        }
    }
}
