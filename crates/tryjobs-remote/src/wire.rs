//! Helpers shared by the HTTP clients.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serializer};
use tryjobs_core::{Error, Result};

/// Prefix prepended to JSON responses by Google APIs to defeat XSSI.
const XSSI_PREFIX: &str = ")]}'";

/// 64-bit integers travel as JSON strings.
pub(crate) mod int64 {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Str(String),
        Num(i64),
    }

    pub fn serialize<S: Serializer>(v: &i64, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
        match StrOrNum::deserialize(d)? {
            StrOrNum::Num(n) => Ok(n),
            StrOrNum::Str(s) if s.is_empty() => Ok(0),
            StrOrNum::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

pub(crate) fn transport(context: &str, err: reqwest::Error) -> Error {
    Error::Transport(format!("{}: {}", context, err))
}

/// Read a JSON response, failing with the body text on a non-2xx status.
pub(crate) async fn read_json<R: DeserializeOwned>(
    context: &str,
    response: reqwest::Response,
) -> Result<R> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| transport(context, e))?;

    if !status.is_success() {
        return Err(status_error(context, status, &text));
    }
    decode(context, &text)
}

/// Server errors, throttling and timeouts are worth retrying; any other
/// non-2xx status is the remote service's final answer.
pub(crate) fn status_error(context: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("{} failed ({}): {}", context, status, body.trim());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Error::Transport(message)
    } else {
        Error::Remote(message)
    }
}

pub(crate) fn decode<R: DeserializeOwned>(context: &str, text: &str) -> Result<R> {
    let body = text.strip_prefix(XSSI_PREFIX).unwrap_or(text);
    serde_json::from_str(body)
        .map_err(|e| Error::Remote(format!("{}: malformed response: {}", context, e)))
}
