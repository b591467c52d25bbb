use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{Auth, ChorusConfig, Endpoint, ProviderConfig};
use crate::extract::ResponsePath;
use crate::http::post_json;
use crate::provider::{ProviderAdapter, RawResponse};
use chorus_types::{ChorusError, ParamMap, Result};

// ---------------------------------------------------------------------------
// BedrockModel
// ---------------------------------------------------------------------------

/// The built-in Bedrock model variants, plus an escape hatch for others.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BedrockModel {
    Jurassic2Ultra,
    TitanTextExpress,
    Llama2Chat70b,
    ClaudeV2,
    /// Any other model id; sent as a flat body with no declared response path.
    Other(String),
}

impl BedrockModel {
    pub const BUILT_IN: [BedrockModel; 4] = [
        BedrockModel::Jurassic2Ultra,
        BedrockModel::TitanTextExpress,
        BedrockModel::Llama2Chat70b,
        BedrockModel::ClaudeV2,
    ];

    pub fn model_id(&self) -> &str {
        match self {
            BedrockModel::Jurassic2Ultra => "ai21.j2-ultra-v1",
            BedrockModel::TitanTextExpress => "amazon.titan-text-express-v1",
            BedrockModel::Llama2Chat70b => "meta.llama2-70b-chat-v1",
            BedrockModel::ClaudeV2 => "anthropic.claude-v2",
            BedrockModel::Other(id) => id,
        }
    }

    pub fn from_model_id(id: &str) -> Self {
        Self::BUILT_IN
            .into_iter()
            .find(|m| m.model_id() == id)
            .unwrap_or_else(|| BedrockModel::Other(id.to_string()))
    }

    fn default_parameters(&self) -> Value {
        match self {
            BedrockModel::Jurassic2Ultra => json!({
                "maxTokens": 200,
                "temperature": 0.1,
                "topP": 1,
                "stopSequences": [],
                "countPenalty": { "scale": 0 },
                "presencePenalty": { "scale": 0.8 },
                "frequencyPenalty": { "scale": 0.1 }
            }),
            BedrockModel::TitanTextExpress => json!({
                "maxTokenCount": 2048,
                "stopSequences": ["User:"],
                "temperature": 0.5,
                "topP": 0.9
            }),
            BedrockModel::Llama2Chat70b => json!({
                "temperature": 0.5,
                "top_p": 0.9,
                "max_gen_len": 200
            }),
            BedrockModel::ClaudeV2 => json!({
                "max_tokens_to_sample": 200,
                "temperature": 0.5,
                "stop_sequences": ["\n\nHuman:"]
            }),
            BedrockModel::Other(_) => json!({}),
        }
    }

    fn response_path(&self) -> Option<ResponsePath> {
        let root = ResponsePath::root();
        match self {
            BedrockModel::Jurassic2Ultra => {
                Some(root.key("completions").index(0).key("data").key("text"))
            }
            BedrockModel::TitanTextExpress => Some(root.key("results").index(0).key("outputText")),
            BedrockModel::Llama2Chat70b => Some(root.key("generation")),
            BedrockModel::ClaudeV2 => Some(root.key("completion")),
            BedrockModel::Other(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// BedrockAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BedrockAdapter {
    client: reqwest::Client,
    model: BedrockModel,
    config: ProviderConfig,
}

impl BedrockAdapter {
    pub fn new(model: BedrockModel, config: &ChorusConfig) -> Result<Self> {
        let api_key = config
            .credentials
            .bedrock_api_key
            .clone()
            .ok_or_else(|| ChorusError::AuthError {
                provider: model.model_id().to_string(),
            })?;
        let base_url = format!(
            "https://bedrock-runtime.{}.amazonaws.com",
            config.credentials.aws_region()
        );

        let mut provider_config = ProviderConfig::new(
            model.model_id(),
            Endpoint {
                base_url,
                auth: Auth::Bearer(api_key),
            },
        )
        .with_defaults(model.default_parameters());
        provider_config.response_path = model.response_path();

        Ok(Self {
            client: reqwest::Client::new(),
            model,
            config: provider_config,
        })
    }

    /// One adapter per built-in model.
    pub fn built_in(config: &ChorusConfig) -> Result<Vec<Self>> {
        BedrockModel::BUILT_IN
            .into_iter()
            .map(|model| Self::new(model, config))
            .collect()
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.config.endpoint.base_url = url;
        self
    }

    pub fn model(&self) -> &BedrockModel {
        &self.model
    }

    fn invoke_url(&self) -> String {
        format!(
            "{}/model/{}/invoke",
            self.config.endpoint.base_url.trim_end_matches('/'),
            self.model.model_id()
        )
    }
}

#[async_trait]
impl ProviderAdapter for BedrockAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn shape_request(&self, prompt: &str, mut params: ParamMap) -> Result<Value> {
        match self.model {
            // Titan nests generation options under textGenerationConfig.
            BedrockModel::TitanTextExpress => {
                params.remove("inputText");
                Ok(json!({
                    "inputText": prompt,
                    "textGenerationConfig": params,
                }))
            }
            _ => {
                params.insert("prompt".into(), Value::String(prompt.to_string()));
                Ok(Value::Object(params))
            }
        }
    }

    async fn send(&self, body: &Value) -> Result<RawResponse> {
        post_json(
            &self.client,
            self.model.model_id(),
            &self.invoke_url(),
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
