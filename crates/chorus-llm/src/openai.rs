use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{Auth, ChorusConfig, Endpoint, ProviderConfig};
use crate::extract::ResponsePath;
use crate::http::post_json;
use crate::provider::{ProviderAdapter, RawResponse};
use chorus_types::{ChorusError, ParamMap, Result};

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

// ---------------------------------------------------------------------------
// OpenAiAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct OpenAiAdapter {
    client: reqwest::Client,
    config: ProviderConfig,
    system_prompt: Option<String>,
}

impl OpenAiAdapter {
    pub fn new(config: &ChorusConfig) -> Result<Self> {
        let key = config
            .credentials
            .openai_api_key
            .clone()
            .ok_or_else(|| ChorusError::AuthError {
                provider: "openai".into(),
            })?;

        let provider_config = ProviderConfig::new(
            DEFAULT_MODEL,
            Endpoint {
                base_url: "https://api.openai.com".to_string(),
                auth: Auth::Bearer(key),
            },
        )
        .with_defaults(json!({
            "model": DEFAULT_MODEL,
            "temperature": 0.5,
            "max_tokens": 200
        }))
        .with_response_path(
            ResponsePath::root()
                .key("choices")
                .index(0)
                .key("message")
                .key("content"),
        );

        Ok(Self {
            client: reqwest::Client::new(),
            config: provider_config,
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
        })
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.config.endpoint.base_url = url;
        self
    }

    /// Target another chat model; the provider id follows the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.config
            .defaults
            .insert("model".into(), Value::String(model.clone()));
        self.config.id = model;
        self
    }

    /// `None` sends only the user message.
    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn shape_request(&self, prompt: &str, mut params: ParamMap) -> Result<Value> {
        if !params.get("model").is_some_and(Value::is_string) {
            return Err(ChorusError::InvalidRequest {
                provider: self.config.id.clone(),
                message: "parameter 'model' must be a string".into(),
            });
        }

        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));
        params.insert("messages".into(), Value::Array(messages));

        Ok(Value::Object(params))
    }

    async fn send(&self, body: &Value) -> Result<RawResponse> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.endpoint.base_url.trim_end_matches('/')
        );
        post_json(
            &self.client,
            &self.config.id,
            &url,
            &self.config.endpoint.auth,
            &[],
            body,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
