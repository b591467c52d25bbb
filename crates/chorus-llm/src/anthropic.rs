use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{Auth, ChorusConfig, Endpoint, ProviderConfig};
use crate::extract::ResponsePath;
use crate::http::post_json;
use crate::provider::{ProviderAdapter, RawResponse};
use chorus_types::{ChorusError, ParamMap, Result};

const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const API_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// AnthropicAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl AnthropicAdapter {
    pub fn new(config: &ChorusConfig) -> Result<Self> {
        let key = config
            .credentials
            .anthropic_api_key
            .clone()
            .ok_or_else(|| ChorusError::AuthError {
                provider: "anthropic".into(),
            })?;

        let provider_config = ProviderConfig::new(
            DEFAULT_MODEL,
            Endpoint {
                base_url: "https://api.anthropic.com".to_string(),
                auth: Auth::Header {
                    name: "x-api-key".into(),
                    value: key,
                },
            },
        )
        .with_defaults(json!({
            "model": DEFAULT_MODEL,
            "max_tokens": 200,
            "temperature": 0.5
        }))
        .with_response_path(ResponsePath::root().key("content").index(0).key("text"));

        Ok(Self {
            client: reqwest::Client::new(),
            config: provider_config,
        })
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.config.endpoint.base_url = url;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.config
            .defaults
            .insert("model".into(), Value::String(model.clone()));
        self.config.id = model;
        self
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn shape_request(&self, prompt: &str, mut params: ParamMap) -> Result<Value> {
        // The Messages API rejects requests without both of these.
        for required in ["model", "max_tokens"] {
            if !params.contains_key(required) {
                return Err(ChorusError::InvalidRequest {
                    provider: self.config.id.clone(),
                    message: format!("missing required parameter '{required}'"),
                });
            }
        }
        params.insert(
            "messages".into(),
            json!([{ "role": "user", "content": prompt }]),
        );
        Ok(Value::Object(params))
    }

    async fn send(&self, body: &Value) -> Result<RawResponse> {
        let url = format!(
            "{}/v1/messages",
            self.config.endpoint.base_url.trim_end_matches('/')
        );
        post_json(
            &self.client,
            &self.config.id,
            &url,
            &self.config.endpoint.auth,
            &[("anthropic-version", API_VERSION)],
            body,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
