//! The single JSON POST shared by every HTTP adapter.

use chorus_types::{ChorusError, Result};
use serde_json::Value;

use crate::config::Auth;
use crate::provider::RawResponse;

/// POST `body` to `url` and decode the reply.
///
/// Any status other than 200 becomes a synthetic [`RawResponse::http_error`]
/// rather than an `Err`, so the failure is still recorded as an outcome.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    auth: &Auth,
    extra_headers: &[(&str, &str)],
    body: &Value,
) -> Result<RawResponse> {
    let mut request = client
        .post(url)
        .header("content-type", "application/json")
        .header("accept", "application/json");

    request = match auth {
        Auth::None => request,
        Auth::Bearer(key) => request.bearer_auth(key),
        Auth::Header { name, value } => request.header(name.as_str(), value.as_str()),
        Auth::QueryKey(key) => request.query(&[("key", key.as_str())]),
    };
    for (name, value) in extra_headers {
        request = request.header(*name, *value);
    }

    tracing::debug!(provider, url, "Sending provider request");

    let resp = request
        .json(body)
        .send()
        .await
        .map_err(|e| ChorusError::Transport {
            provider: provider.to_string(),
            message: e.to_string(),
        })?;

    let status = resp.status();
    let response_body = resp.text().await.map_err(|e| ChorusError::Transport {
        provider: provider.to_string(),
        message: e.to_string(),
    })?;

    if status != reqwest::StatusCode::OK {
        tracing::warn!(provider, status = status.as_u16(), "Provider returned non-success status");
        return Ok(RawResponse::http_error(
            status.as_u16(),
            extract_error_message(&response_body),
        ));
    }

    let json: Value =
        serde_json::from_str(&response_body).map_err(|e| ChorusError::ProviderError {
            provider: provider.to_string(),
            status: status.as_u16(),
            message: format!("Failed to parse response JSON: {e}"),
        })?;

    Ok(RawResponse::ok(json))
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v["error"]["message"]
                .as_str()
                .or_else(|| v["message"].as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string())
}
