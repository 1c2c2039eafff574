//! Client for the async token-based protocol (JSON over pRPC).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tryjobs_core::remote::{Build, BuildPredicate, BuildStatus, BuildTask, BuildUpdate, BuilderId, GerritChange};
use tryjobs_core::{Error, Result};

use crate::wire::{int64, read_json, transport};

const SERVICE: &str = "buildbucket.v2.Builds";

/// Header carrying the build's update or registration token.
const TOKEN_HEADER: &str = "x-buildbucket-token";

const BUILD_FIELDS: &str = "id,builder,status,createTime,input.gerritChanges";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGerritChange {
    #[serde(default)]
    host: String,
    #[serde(default)]
    project: String,
    #[serde(with = "int64", default)]
    change: i64,
    #[serde(with = "int64", default)]
    patchset: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInput {
    #[serde(default)]
    gerrit_changes: Vec<WireGerritChange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBuild {
    #[serde(with = "int64")]
    id: i64,
    #[serde(default)]
    builder: BuilderId,
    #[serde(default)]
    status: BuildStatus,
    create_time: DateTime<Utc>,
    #[serde(default)]
    input: WireInput,
}

impl From<WireBuild> for Build {
    fn from(b: WireBuild) -> Self {
        Build {
            id: b.id,
            builder: b.builder,
            status: b.status,
            create_time: b.create_time,
            gerrit_changes: b
                .input
                .gerrit_changes
                .into_iter()
                .map(|c| GerritChange {
                    host: c.host,
                    project: c.project,
                    change: c.change,
                    patchset: c.patchset,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskId<'a> {
    target: &'a str,
    id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireTask<'a> {
    id: TaskId<'a>,
    status: BuildStatus,
    summary_markdown: &'a str,
    link: &'a str,
    #[serde(with = "int64")]
    update_id: i64,
}

impl<'a> From<&'a BuildTask> for WireTask<'a> {
    fn from(t: &'a BuildTask) -> Self {
        WireTask {
            id: TaskId {
                target: &t.target,
                id: &t.id,
            },
            status: t.status,
            summary_markdown: &t.summary_markdown,
            link: &t.link,
            update_id: t.update_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetBuildRequest {
    #[serde(with = "int64")]
    id: i64,
    fields: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartBuildRequest<'a> {
    request_id: &'a str,
    #[serde(with = "int64")]
    build_id: i64,
    task: StartTask<'a>,
}

#[derive(Debug, Serialize)]
struct StartTask<'a> {
    id: TaskId<'a>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBuildResponse {
    #[serde(default)]
    update_build_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBuildRequest<'a> {
    build: UpdatedBuild<'a>,
    update_mask: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdatedBuild<'a> {
    #[serde(with = "int64")]
    id: i64,
    output: BuildOutput<'a>,
    infra: BuildInfra<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildOutput<'a> {
    status: BuildStatus,
    summary_markdown: &'a str,
}

#[derive(Debug, Serialize)]
struct BuildInfra<'a> {
    backend: BuildBackend<'a>,
}

#[derive(Debug, Serialize)]
struct BuildBackend<'a> {
    task: WireTask<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelBuildRequest<'a> {
    #[serde(with = "int64")]
    id: i64,
    summary_markdown: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchBuildsRequest<'a> {
    predicate: WirePredicate<'a>,
    page_token: &'a str,
    fields: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePredicate<'a> {
    builder: SearchBuilder<'a>,
    status: BuildStatus,
    create_time: TimeRange,
}

#[derive(Debug, Serialize)]
struct SearchBuilder<'a> {
    project: &'a str,
    bucket: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeRange {
    end_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchBuildsResponse {
    #[serde(default)]
    builds: Vec<WireBuild>,
    #[serde(default)]
    next_page_token: String,
}

/// Async protocol client.
pub struct AsyncClient {
    client: reqwest::Client,
    host: String,
    access_token: Option<String>,
}

impl AsyncClient {
    /// `host` is the service origin, e.g. `https://cr-buildbucket.appspot.com`.
    pub fn new(client: reqwest::Client, host: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into().trim_end_matches('/').to_string(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    async fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        build_token: Option<&str>,
        body: &B,
    ) -> Result<R> {
        debug!(method, "Async API request");
        let mut builder = self
            .client
            .post(format!("{}/prpc/{}/{}", self.host, SERVICE, method))
            .header("Accept", "application/json")
            .json(body);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(token) = build_token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        let response = builder.send().await.map_err(|e| transport(method, e))?;
        read_json(method, response).await
    }

    pub async fn get_build(&self, build_id: i64) -> Result<Build> {
        let build: WireBuild = self
            .call(
                "GetBuild",
                None,
                &GetBuildRequest {
                    id: build_id,
                    fields: BUILD_FIELDS,
                },
            )
            .await?;
        Ok(build.into())
    }

    /// Start a build. `request_id` deduplicates retries; a second call with a
    /// different request id fails with an "already started" error.
    pub async fn start_build(
        &self,
        build_id: i64,
        request_id: &str,
        target: &str,
        registration_token: &str,
    ) -> Result<String> {
        let body = StartBuildRequest {
            request_id,
            build_id,
            task: StartTask {
                id: TaskId {
                    target,
                    id: request_id,
                },
            },
        };
        let token = (!registration_token.is_empty()).then_some(registration_token);
        let resp: StartBuildResponse = self.call("StartBuild", token, &body).await?;
        Ok(resp.update_build_token)
    }

    pub async fn update_build(&self, update: &BuildUpdate, token: &str) -> Result<()> {
        let body = UpdateBuildRequest {
            build: UpdatedBuild {
                id: update.build_id,
                output: BuildOutput {
                    status: update.status,
                    summary_markdown: &update.summary_markdown,
                },
                infra: BuildInfra {
                    backend: BuildBackend {
                        task: (&update.task).into(),
                    },
                },
            },
            update_mask: "build.output.status,build.output.summary_markdown,build.infra.backend.task",
        };
        let _: serde_json::Value = self.call("UpdateBuild", Some(token), &body).await?;
        Ok(())
    }

    pub async fn cancel_build(&self, build_id: i64, reason: &str) -> Result<()> {
        let body = CancelBuildRequest {
            id: build_id,
            summary_markdown: reason,
        };
        let _: serde_json::Value = self.call("CancelBuild", None, &body).await?;
        Ok(())
    }

    /// Search builds, following pagination to the end.
    pub async fn search(&self, predicate: &BuildPredicate) -> Result<Vec<Build>> {
        let mut builds = Vec::new();
        let mut page_token = String::new();
        loop {
            let body = SearchBuildsRequest {
                predicate: WirePredicate {
                    builder: SearchBuilder {
                        project: &predicate.project,
                        bucket: &predicate.bucket,
                    },
                    status: predicate.status,
                    create_time: TimeRange {
                        end_time: predicate.created_before,
                    },
                },
                page_token: &page_token,
                fields: "builds.*.id,builds.*.builder,builds.*.status,builds.*.createTime,nextPageToken",
            };
            let resp: SearchBuildsResponse = self.call("SearchBuilds", None, &body).await?;
            builds.extend(resp.builds.into_iter().map(Build::from));
            if resp.next_page_token.is_empty() {
                return Ok(builds);
            }
            if resp.next_page_token == page_token {
                return Err(Error::Remote(
                    "SearchBuilds returned the same page token twice".to_string(),
                ));
            }
            page_token = resp.next_page_token;
        }
    }
}
