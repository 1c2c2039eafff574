//! Gerrit code review client.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use tryjobs_core::Result;
use tryjobs_core::review::CodeReview;

use crate::wire::{read_json, transport};

#[derive(Debug, Deserialize)]
struct ChangeInfo {
    branch: String,
}

pub struct GerritClient {
    client: reqwest::Client,
    url: String,
}

impl GerritClient {
    /// `url` is the review server, e.g. `https://skia-review.googlesource.com`.
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CodeReview for GerritClient {
    async fn change_branch(&self, issue: i64) -> Result<String> {
        let context = format!("get change {}", issue);
        debug!(issue, "Fetching change properties");
        let response = self
            .client
            .get(format!("{}/changes/{}/detail", self.url, issue))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| transport(&context, e))?;
        let info: ChangeInfo = read_json(&context, response).await?;
        Ok(info.branch)
    }
}
