//! Client for the legacy lease-based REST protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use tryjobs_core::Result;
use tryjobs_core::remote::{
    FailureReason, Heartbeat, PeekPage, Rejection, RejectionReason, RemoteReply,
};

use crate::wire::{int64, read_json, transport};

/// Error object embedded in a successful legacy response.
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl From<ApiError> for Rejection {
    fn from(e: ApiError) -> Self {
        Rejection::new(RejectionReason::from_code(&e.reason), e.message)
    }
}

#[derive(Debug, Deserialize)]
struct BuildMessage {
    #[serde(with = "int64", default)]
    id: i64,
    #[serde(with = "int64", default)]
    lease_key: i64,
}

#[derive(Debug, Deserialize)]
struct BuildResponse {
    build: Option<BuildMessage>,
    error: Option<ApiError>,
}

#[derive(Debug, Serialize)]
struct LeaseRequest {
    #[serde(with = "int64")]
    lease_expiration_ts: i64,
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    #[serde(with = "int64")]
    lease_key: i64,
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct OneHeartbeat {
    #[serde(with = "int64")]
    build_id: i64,
    #[serde(with = "int64")]
    lease_key: i64,
    #[serde(with = "int64")]
    lease_expiration_ts: i64,
}

#[derive(Debug, Serialize)]
struct HeartbeatBatchRequest {
    heartbeats: Vec<OneHeartbeat>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatResult {
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatBatchResponse {
    #[serde(default)]
    results: Vec<HeartbeatResult>,
    error: Option<ApiError>,
}

#[derive(Debug, Serialize)]
struct SucceedRequest<'a> {
    #[serde(with = "int64")]
    lease_key: i64,
    result_details_json: &'a str,
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct FailRequest<'a> {
    failure_reason: &'a str,
    #[serde(with = "int64")]
    lease_key: i64,
    result_details_json: &'a str,
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct CancelRequest<'a> {
    result_details_json: &'a str,
}

#[derive(Debug, Deserialize)]
struct PeekResponse {
    #[serde(default)]
    builds: Vec<BuildMessage>,
    #[serde(default)]
    next_cursor: String,
    error: Option<ApiError>,
}

/// Lease expirations are expressed in microseconds since the epoch.
fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp() * 1_000_000
}

/// Legacy protocol client.
pub struct LegacyClient {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl LegacyClient {
    /// `base_url` must end with a slash, e.g.
    /// `https://cr-buildbucket.appspot.com/api/buildbucket/v1/`.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            client,
            base_url,
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Accept", "application/json");
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        context: &str,
        path: &str,
        body: &B,
    ) -> Result<R> {
        debug!(path, "Legacy API request");
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|e| transport(context, e))?;
        read_json(context, response).await
    }

    async fn post_build(
        &self,
        context: &str,
        build_id: i64,
        action: &str,
        body: &impl Serialize,
    ) -> Result<RemoteReply<BuildResponse>> {
        let mut resp: BuildResponse = self
            .post(context, &format!("builds/{}/{}", build_id, action), body)
            .await?;
        Ok(match resp.error.take() {
            Some(e) => Err(e.into()),
            None => Ok(resp),
        })
    }

    /// List scheduled builds in a bucket.
    pub async fn peek(
        &self,
        bucket: &str,
        max_builds: usize,
        cursor: &str,
    ) -> Result<RemoteReply<PeekPage>> {
        let context = "peek";
        let max_builds = max_builds.to_string();
        let response = self
            .request(reqwest::Method::GET, "peek")
            .query(&[
                ("bucket", bucket),
                ("max_builds", max_builds.as_str()),
                ("start_cursor", cursor),
            ])
            .send()
            .await
            .map_err(|e| transport(context, e))?;
        let resp: PeekResponse = read_json(context, response).await?;
        if let Some(e) = resp.error {
            return Ok(Err(e.into()));
        }
        Ok(Ok(PeekPage {
            build_ids: resp.builds.into_iter().map(|b| b.id).collect(),
            next_cursor: resp.next_cursor,
        }))
    }

    /// Lease a build until `expiration`. A missing lease key is reported
    /// as zero.
    pub async fn lease(&self, build_id: i64, expiration: DateTime<Utc>) -> Result<RemoteReply<i64>> {
        let body = LeaseRequest {
            lease_expiration_ts: micros(expiration),
        };
        let context = format!("lease build {}", build_id);
        Ok(self
            .post_build(&context, build_id, "lease", &body)
            .await?
            .map(|resp| resp.build.map(|b| b.lease_key).unwrap_or(0)))
    }

    pub async fn start(&self, build_id: i64, lease_key: i64, url: &str) -> Result<RemoteReply<()>> {
        let body = StartRequest { lease_key, url };
        let context = format!("start build {}", build_id);
        Ok(self
            .post_build(&context, build_id, "start", &body)
            .await?
            .map(|_| ()))
    }

    /// Renew leases. Returns one entry per heartbeat, in request order.
    pub async fn heartbeat(&self, batch: &[Heartbeat]) -> Result<Vec<Option<Rejection>>> {
        let body = HeartbeatBatchRequest {
            heartbeats: batch
                .iter()
                .map(|h| OneHeartbeat {
                    build_id: h.build_id,
                    lease_key: h.lease_key,
                    lease_expiration_ts: micros(h.expiration),
                })
                .collect(),
        };
        let resp: HeartbeatBatchResponse = self.post("heartbeat", "heartbeat", &body).await?;
        if let Some(e) = resp.error {
            return Err(tryjobs_core::Error::Remote(format!(
                "heartbeat batch rejected: {} ({})",
                e.message, e.reason
            )));
        }
        Ok(resp
            .results
            .into_iter()
            .map(|r| r.error.map(Rejection::from))
            .collect())
    }

    pub async fn succeed(
        &self,
        build_id: i64,
        lease_key: i64,
        details_json: &str,
        url: &str,
    ) -> Result<RemoteReply<()>> {
        let body = SucceedRequest {
            lease_key,
            result_details_json: details_json,
            url,
        };
        let context = format!("succeed build {}", build_id);
        Ok(self
            .post_build(&context, build_id, "succeed", &body)
            .await?
            .map(|_| ()))
    }

    pub async fn fail(
        &self,
        build_id: i64,
        lease_key: i64,
        reason: FailureReason,
        details_json: &str,
        url: &str,
    ) -> Result<RemoteReply<()>> {
        let body = FailRequest {
            failure_reason: reason.as_str(),
            lease_key,
            result_details_json: details_json,
            url,
        };
        let context = format!("fail build {}", build_id);
        Ok(self
            .post_build(&context, build_id, "fail", &body)
            .await?
            .map(|_| ()))
    }

    pub async fn cancel(&self, build_id: i64, details_json: &str) -> Result<RemoteReply<()>> {
        let body = CancelRequest {
            result_details_json: details_json,
        };
        let context = format!("cancel build {}", build_id);
        Ok(self
            .post_build(&context, build_id, "cancel", &body)
            .await?
            .map(|_| ()))
    }
}
