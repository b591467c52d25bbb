use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{Auth, ChorusConfig, Endpoint, ProviderConfig};
use crate::extract::ResponsePath;
use crate::http::post_json;
use crate::provider::{top_level_error, ProviderAdapter, RawResponse};
use chorus_types::{ChorusError, ParamMap, Result};

const DEFAULT_MODEL: &str = "gemini-2.5-pro";

// ---------------------------------------------------------------------------
// GeminiAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GeminiAdapter {
    client: reqwest::Client,
    model: String,
    config: ProviderConfig,
}

impl GeminiAdapter {
    pub fn new(config: &ChorusConfig) -> Result<Self> {
        let key = config
            .credentials
            .google_api_key
            .clone()
            .ok_or_else(|| ChorusError::AuthError {
                provider: "google".into(),
            })?;

        let provider_config = ProviderConfig::new(
            DEFAULT_MODEL,
            Endpoint {
                base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                auth: Auth::QueryKey(key),
            },
        )
        .with_defaults(json!({
            "safetySettings": [
                { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_ONLY_HIGH" }
            ],
            "generationConfig": {
                "stopSequences": ["Title"],
                "temperature": 1.0,
                "maxOutputTokens": 800,
                "topP": 0.8,
                "topK": 10
            }
        }))
        .with_response_path(
            ResponsePath::root()
                .key("candidates")
                .index(0)
                .key("content")
                .key("parts")
                .index(0)
                .key("text"),
        );

        Ok(Self {
            client: reqwest::Client::new(),
            model: DEFAULT_MODEL.to_string(),
            config: provider_config,
        })
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.config.endpoint.base_url = url;
        self
    }

    /// Target another Gemini model; the provider id follows the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self.config.id = self.model.clone();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.config.endpoint.base_url.trim_end_matches('/'),
            self.model,
            method
        )
    }

    /// Token count for `text` as reported by the `countTokens` endpoint.
    pub async fn count_tokens(&self, text: &str) -> Result<u64> {
        let body = json!({ "contents": [{ "parts": [{ "text": text }] }] });
        let raw = post_json(
            &self.client,
            &self.config.id,
            &self.method_url("countTokens"),
            &self.config.endpoint.auth,
            &[],
            &body,
        )
        .await?;

        if !raw.is_success() {
            return Err(ChorusError::ProviderError {
                provider: self.config.id.clone(),
                status: raw.status,
                message: raw.body["details"].as_str().unwrap_or_default().to_string(),
            });
        }
        raw.body["totalTokens"]
            .as_u64()
            .ok_or_else(|| ChorusError::ProviderError {
                provider: self.config.id.clone(),
                status: raw.status,
                message: "Missing totalTokens in countTokens response".into(),
            })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn shape_request(&self, prompt: &str, mut params: ParamMap) -> Result<Value> {
        params.insert(
            "contents".into(),
            json!([{ "parts": [{ "text": prompt }] }]),
        );
        Ok(Value::Object(params))
    }

    async fn send(&self, body: &Value) -> Result<RawResponse> {
        post_json(
            &self.client,
            &self.config.id,
            &self.method_url("generateContent"),
            &self.config.endpoint.auth,
            &[],
            body,
        )
        .await
    }

    /// A blocked prompt comes back as 200 with `promptFeedback.blockReason`
    /// and no candidates.
    fn application_error(&self, body: &Value) -> Option<String> {
        if let Some(reason) = body["promptFeedback"]["blockReason"].as_str() {
            return Some(format!("Prompt blocked: {reason}"));
        }
        top_level_error(body)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::extract::extract_for;
    use chorus_types::Extracted;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> ChorusConfig {
        ChorusConfig::default().with_credentials(Credentials {
            google_api_key: Some("g-key".into()),
            ..Default::default()
        })
    }

    #[test]
    fn new_without_key_is_auth_error() {
        let err = GeminiAdapter::new(&ChorusConfig::default()).unwrap_err();
        assert!(matches!(err, ChorusError::AuthError { provider } if provider == "google"));
    }

    #[test]
    fn body_wraps_prompt_in_contents_and_keeps_defaults() {
        let adapter = GeminiAdapter::new(&config()).unwrap();
        let body = adapter.build_request("Write a story", &ParamMap::new()).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Write a story");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 800);
        assert_eq!(body["safetySettings"][0]["threshold"], "BLOCK_ONLY_HIGH");
    }

    #[test]
    fn nested_overlay_keeps_generation_defaults() {
        let adapter = GeminiAdapter::new(&config()).unwrap();
        let overlay = match json!({"generationConfig": {"temperature": 0.3}}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        let body = adapter.build_request("p", &overlay).unwrap();
        assert_eq!(body["generationConfig"]["temperature"], 0.3);
        assert_eq!(body["generationConfig"]["topK"], 10);
    }

    #[test]
    fn with_model_changes_id_and_url() {
        let adapter = GeminiAdapter::new(&config())
            .unwrap()
            .with_model("gemini-2.5-flash")
            .with_base_url("http://local/".into());
        assert_eq!(adapter.id(), "gemini-2.5-flash");
        assert_eq!(
            adapter.method_url("generateContent"),
            "http://local/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn blocked_prompt_is_application_error() {
        let adapter = GeminiAdapter::new(&config()).unwrap();
        let body = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        assert_eq!(
            adapter.application_error(&body),
            Some("Prompt blocked: SAFETY".into())
        );
        let ok = json!({"candidates": [{"content": {"parts": [{"text": "x"}]}}]});
        assert_eq!(adapter.application_error(&ok), None);
    }

    #[tokio::test]
    async fn generate_content_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-pro:generateContent"))
            .and(query_param("key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "Once upon a time.\n" }], "role": "model" },
                    "finishReason": "STOP"
                }]
            })))
            .mount(&server)
            .await;

        let adapter = GeminiAdapter::new(&config()).unwrap().with_base_url(server.uri());
        let call = adapter.invoke("Write a story", &ParamMap::new()).await.unwrap();
        assert_eq!(
            extract_for(adapter.response_path(), &call.response.body),
            Extracted::Text("Once upon a time.".into())
        );
    }

    #[tokio::test]
    async fn count_tokens_reads_total() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-pro:countTokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"totalTokens": 7})))
            .mount(&server)
            .await;

        let adapter = GeminiAdapter::new(&config()).unwrap().with_base_url(server.uri());
        assert_eq!(adapter.count_tokens("a magic backpack").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn count_tokens_failure_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let adapter = GeminiAdapter::new(&config()).unwrap().with_base_url(server.uri());
        let err = adapter.count_tokens("x").await.unwrap_err();
        assert!(matches!(err, ChorusError::ProviderError { status: 403, .. }));
    }
}
