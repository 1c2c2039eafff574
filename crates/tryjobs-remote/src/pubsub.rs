//! Publishes task updates to Pub/Sub topics over the REST API.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::info;
use tryjobs_core::remote::TaskUpdate;
use tryjobs_core::{Error, Result};

use crate::builds::WireTask;
use crate::wire::{read_json, transport};

pub const PUBSUB_API_URL: &str = "https://pubsub.googleapis.com";

static TOPIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^projects/([a-zA-Z_-]+)/topics/([a-zA-Z_-]+)$").expect("valid topic regex")
});

/// Split a fully-qualified `projects/<p>/topics/<t>` name. Anything else is
/// a bare topic in `default_project`.
pub fn parse_topic<'a>(topic: &'a str, default_project: &'a str) -> (&'a str, &'a str) {
    match TOPIC_RE.captures(topic) {
        Some(caps) => match (caps.get(1), caps.get(2)) {
            (Some(p), Some(t)) => (p.as_str(), t.as_str()),
            _ => (default_project, topic),
        },
        None => (default_project, topic),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTaskUpdate<'a> {
    build_id: &'a str,
    task: WireTask<'a>,
}

#[derive(Debug, Serialize)]
struct PublishMessage {
    data: String,
}

#[derive(Debug, Serialize)]
struct PublishRequest {
    messages: Vec<PublishMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

pub struct PubSubPublisher {
    client: reqwest::Client,
    base_url: String,
    project: String,
    access_token: Option<String>,
}

impl PubSubPublisher {
    /// `project` is used for topics that are not fully qualified.
    pub fn new(client: reqwest::Client, project: impl Into<String>) -> Self {
        Self {
            client,
            base_url: PUBSUB_API_URL.to_string(),
            project: project.into(),
            access_token: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn encode(update: &TaskUpdate) -> Result<PublishRequest> {
        let body = serde_json::to_vec(&WireTaskUpdate {
            build_id: &update.build_id,
            task: (&update.task).into(),
        })
        .map_err(|e| Error::Internal(format!("failed to encode task update: {}", e)))?;
        Ok(PublishRequest {
            messages: vec![PublishMessage {
                data: STANDARD.encode(body),
            }],
        })
    }

    /// Publish one task update and wait for the server to acknowledge it.
    pub async fn publish(&self, topic: &str, update: &TaskUpdate) -> Result<()> {
        let (project, topic) = parse_topic(topic, &self.project);
        let context = format!("publish to {}/{}", project, topic);
        info!(build_id = %update.build_id, project, topic, "Sending pubsub message");

        let mut builder = self
            .client
            .post(format!(
                "{}/v1/projects/{}/topics/{}:publish",
                self.base_url, project, topic
            ))
            .json(&Self::encode(update)?);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| transport(&context, e))?;
        let resp: PublishResponse = read_json(&context, response).await?;
        if resp.message_ids.is_empty() {
            return Err(Error::Remote(format!("{}: no message id returned", context)));
        }
        Ok(())
    }
}
