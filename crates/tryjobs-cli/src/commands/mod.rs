//! CLI command implementations.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tryjobs_config::IntegratorConfig;
use tryjobs_db::{DbJobCache, PgJobDb, create_pool, run_migrations};
use tryjobs_integrator::{Collaborators, TryJobIntegrator};
use tryjobs_remote::{AsyncClient, BuildServiceClient, GerritClient, LegacyClient, PubSubPublisher};

use crate::git::{GitRepos, GitTaskCfgCache};

/// Run the integrator until interrupted.
pub async fn run(
    config_path: &Path,
    database_url: Option<String>,
    access_token: Option<String>,
) -> Result<()> {
    let config = IntegratorConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let database_url = database_url
        .or_else(|| config.database_url.clone())
        .context("no database URL configured")?;
    info!("Connecting to database...");
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;
    info!("Database connected");

    let db = Arc::new(PgJobDb::new(pool));
    let cache = Arc::new(DbJobCache::new(db.clone(), config.search_window));

    let http = reqwest::Client::new();
    let mut legacy = LegacyClient::new(http.clone(), config.legacy_api_url.clone());
    let mut builds = AsyncClient::new(http.clone(), config.async_api_url.clone());
    let mut pubsub = PubSubPublisher::new(http.clone(), config.pubsub_project.clone());
    if let Some(token) = access_token {
        legacy = legacy.with_access_token(token.clone());
        builds = builds.with_access_token(token.clone());
        pubsub = pubsub.with_access_token(token);
    }
    let remote = Arc::new(BuildServiceClient::new(legacy, builds, pubsub, config.target.clone()));
    let review = Arc::new(GerritClient::new(http, config.review_url.clone()));

    let repos = Arc::new(GitRepos::new(config.repo_checkouts.clone()));
    let task_cfg = Arc::new(GitTaskCfgCache::new(repos.clone()));

    let integrator = Arc::new(TryJobIntegrator::new(
        config,
        Collaborators {
            db,
            cache,
            remote,
            review,
            repos,
            task_cfg,
        },
    ));

    let shutdown = CancellationToken::new();
    let handles = integrator.start(shutdown.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down; waiting for in-flight work");
    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Integrator task failed");
        }
    }
    Ok(())
}

pub fn validate(path: &Path) -> Result<()> {
    let config = IntegratorConfig::from_file(path)?;
    for (project, repo) in &config.project_repos {
        if !config.repo_checkouts.contains_key(repo) {
            println!("Warning: project {} maps to {} which has no checkout", project, repo);
        }
    }
    println!(
        "Configuration is valid: bucket {}, {} project(s)",
        config.bucket,
        config.project_repos.len()
    );
    Ok(())
}
