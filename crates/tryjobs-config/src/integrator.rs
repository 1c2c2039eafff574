//! Integrator configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LEGACY_API_URL_PROD: &str = "https://cr-buildbucket.appspot.com/api/buildbucket/v1/";
pub const LEGACY_API_URL_TESTING: &str = "http://localhost:8008/api/buildbucket/v1/";
pub const ASYNC_API_URL_PROD: &str = "https://cr-buildbucket.appspot.com";

/// A repo state excluded from try jobs, e.g. a CL with an invalid hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRepoState {
    pub issue: String,
    pub patchset: String,
}

/// Configuration of the try job integrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegratorConfig {
    /// Remote bucket polled for new builds.
    pub bucket: String,
    /// Public host of the scheduler, used to build job links.
    pub host: String,
    /// Task backend target reported with async updates.
    pub target: String,
    /// Remote project owning the bucket.
    pub project: String,
    pub legacy_api_url: String,
    pub async_api_url: String,
    pub review_url: String,
    /// Default Pub/Sub project for topics given without one.
    pub pubsub_project: String,
    pub database_url: Option<String>,

    /// Lease taken at intake. Shorter than the renewal so that a build
    /// leased but never inserted becomes available again quickly.
    pub initial_lease: Duration,
    pub renewal_lease: Duration,

    pub update_interval: Duration,
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    /// Backstop scan for requested jobs missed by the change stream.
    pub start_poll_interval: Duration,
    /// Started builds older than this are checked by the cleanup loop.
    pub cleanup_age: Duration,
    /// Trailing window searched when looking up the job for a build.
    pub search_window: Duration,

    pub peek_max_builds: usize,
    pub heartbeat_batch_size: usize,

    /// Code review project to repository URL.
    pub project_repos: BTreeMap<String, String>,
    /// Repository URL to local checkout.
    pub repo_checkouts: BTreeMap<String, PathBuf>,
    pub skip_repo_states: Vec<SkipRepoState>,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            host: String::new(),
            target: String::new(),
            project: "skia".to_string(),
            legacy_api_url: LEGACY_API_URL_PROD.to_string(),
            async_api_url: ASYNC_API_URL_PROD.to_string(),
            review_url: "https://skia-review.googlesource.com".to_string(),
            pubsub_project: String::new(),
            database_url: None,
            initial_lease: Duration::from_secs(30 * 60),
            renewal_lease: Duration::from_secs(60 * 60),
            update_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(15 * 60),
            start_poll_interval: Duration::from_secs(60),
            cleanup_age: Duration::from_secs(3 * 60 * 60),
            search_window: Duration::from_secs(4 * 24 * 60 * 60),
            peek_max_builds: 50,
            heartbeat_batch_size: 200,
            project_repos: BTreeMap::new(),
            repo_checkouts: BTreeMap::new(),
            skip_repo_states: Vec::new(),
        }
    }
}

impl IntegratorConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_config(&text)
    }
}

/// Parse the integrator configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<IntegratorConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut cfg = IntegratorConfig::default();

    for node in doc.nodes() {
        let name = node.name().value();
        match name {
            "bucket" => cfg.bucket = required_string(node, name)?,
            "host" => cfg.host = required_string(node, name)?,
            "target" => cfg.target = required_string(node, name)?,
            "project" => cfg.project = required_string(node, name)?,
            "legacy-api" => {
                cfg.legacy_api_url = match required_string(node, name)?.as_str() {
                    "prod" => LEGACY_API_URL_PROD.to_string(),
                    "testing" => LEGACY_API_URL_TESTING.to_string(),
                    other => validate_url(name, other)?,
                };
            }
            "async-api" => cfg.async_api_url = validate_url(name, &required_string(node, name)?)?,
            "review-url" => cfg.review_url = validate_url(name, &required_string(node, name)?)?,
            "pubsub-project" => cfg.pubsub_project = required_string(node, name)?,
            "database-url" => cfg.database_url = Some(required_string(node, name)?),
            "lease" => {
                if let Some(d) = get_duration_prop(node, "initial")? {
                    cfg.initial_lease = d;
                }
                if let Some(d) = get_duration_prop(node, "renewal")? {
                    cfg.renewal_lease = d;
                }
            }
            "intervals" => {
                if let Some(d) = get_duration_prop(node, "update")? {
                    cfg.update_interval = d;
                }
                if let Some(d) = get_duration_prop(node, "poll")? {
                    cfg.poll_interval = d;
                }
                if let Some(d) = get_duration_prop(node, "cleanup")? {
                    cfg.cleanup_interval = d;
                }
                if let Some(d) = get_duration_prop(node, "start")? {
                    cfg.start_poll_interval = d;
                }
            }
            "cleanup-age" => cfg.cleanup_age = parse_duration(&required_string(node, name)?)?,
            "search-window" => cfg.search_window = parse_duration(&required_string(node, name)?)?,
            "batch" => {
                if let Some(n) = get_usize_prop(node, "peek")? {
                    cfg.peek_max_builds = n;
                }
                if let Some(n) = get_usize_prop(node, "heartbeat")? {
                    cfg.heartbeat_batch_size = n;
                }
            }
            "project-repo" => {
                let (project, repo) = string_pair(node, name)?;
                if cfg.project_repos.insert(project.clone(), repo).is_some() {
                    return Err(ConfigError::Duplicate(format!("project-repo {}", project)));
                }
            }
            "repo-checkout" => {
                let (repo, path) = string_pair(node, name)?;
                cfg.repo_checkouts.insert(repo, PathBuf::from(path));
            }
            "skip-repo-state" => {
                let issue = get_string_prop(node, "issue")
                    .ok_or_else(|| ConfigError::MissingField("skip-repo-state issue".to_string()))?;
                let patchset = get_string_prop(node, "patchset").ok_or_else(|| {
                    ConfigError::MissingField("skip-repo-state patchset".to_string())
                })?;
                cfg.skip_repo_states.push(SkipRepoState { issue, patchset });
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if cfg.bucket.is_empty() {
        return Err(ConfigError::MissingField("bucket".to_string()));
    }
    if cfg.host.is_empty() {
        return Err(ConfigError::MissingField("host".to_string()));
    }
    for (field, value) in [
        ("lease initial", cfg.initial_lease),
        ("lease renewal", cfg.renewal_lease),
        ("intervals update", cfg.update_interval),
        ("intervals poll", cfg.poll_interval),
        ("intervals cleanup", cfg.cleanup_interval),
        ("intervals start", cfg.start_poll_interval),
        ("cleanup-age", cfg.cleanup_age),
        ("search-window", cfg.search_window),
    ] {
        if value.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: "duration must be positive".to_string(),
            });
        }
    }
    if cfg.heartbeat_batch_size == 0 || cfg.peek_max_builds == 0 {
        return Err(ConfigError::InvalidValue {
            field: "batch".to_string(),
            message: "batch sizes must be positive".to_string(),
        });
    }

    Ok(cfg)
}

/// Parse a duration such as `500ms`, `30s`, `15m`, `3h` or `4d`.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        field: "duration".to_string(),
        message: format!("{}: {:?}", message, s),
    };

    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid("missing unit"))?;
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().map_err(|_| invalid("missing amount"))?;

    let scale = match unit {
        "ms" => return Ok(Duration::from_millis(n)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Err(invalid("unknown unit")),
    };
    n.checked_mul(scale)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid("too large"))
}

fn validate_url(field: &str, value: &str) -> ConfigResult<String> {
    url::Url::parse(value).map_err(|e| ConfigError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    })?;
    Ok(value.to_string())
}

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn string_pair(node: &KdlNode, field: &str) -> ConfigResult<(String, String)> {
    let args = get_all_string_args(node);
    match args.as_slice() {
        [a, b] if !a.is_empty() && !b.is_empty() => Ok((a.clone(), b.clone())),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected two non-empty string arguments".to_string(),
        }),
    }
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_duration_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    get_string_prop(node, name)
        .map(|s| parse_duration(&s))
        .transpose()
}

fn get_usize_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<usize>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    value
        .as_integer()
        .and_then(|n| usize::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: name.to_string(),
            message: "expected a non-negative integer".to_string(),
        })
}
