use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chorus_types::{ParamMap, Result};
use serde_json::{json, Value};

use crate::config::ProviderConfig;
use crate::extract::ResponsePath;
use crate::params::merge_parameters;

// ---------------------------------------------------------------------------
// RawResponse / ProviderCall
// ---------------------------------------------------------------------------

/// Decoded provider response. Non-200 replies carry a synthetic
/// `{error, details, statusCode}` body instead of an error.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Value,
}

impl RawResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn http_error(status: u16, details: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({
                "error": "Provider returned a non-success status",
                "details": details.into(),
                "statusCode": status,
            }),
        }
    }

    /// Only 200 counts as success; partial-success bodies are not inspected.
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Everything one invocation produced.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub request_body: Value,
    pub response: RawResponse,
    /// Wall-clock time around the network call only.
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// ProviderAdapter
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Static configuration: id, defaults, endpoint, extraction path.
    fn config(&self) -> &ProviderConfig;

    /// Shape the provider-specific body from the prompt and merged parameters.
    fn shape_request(&self, prompt: &str, params: ParamMap) -> Result<Value>;

    /// Perform exactly one call to the inference endpoint.
    async fn send(&self, body: &Value) -> Result<RawResponse>;

    fn id(&self) -> &str {
        &self.config().id
    }

    fn response_path(&self) -> Option<&ResponsePath> {
        self.config().response_path.as_ref()
    }

    /// Application-level failure signaled inside a 200 body.
    fn application_error(&self, body: &Value) -> Option<String> {
        top_level_error(body)
    }

    /// Merge `overlay` onto the defaults and shape the request body.
    fn build_request(&self, prompt: &str, overlay: &ParamMap) -> Result<Value> {
        let params = merge_parameters(&self.config().defaults, overlay);
        self.shape_request(prompt, params)
    }

    /// Build the request, call the provider, and time the call.
    async fn invoke(&self, prompt: &str, overlay: &ParamMap) -> Result<ProviderCall> {
        let request_body = self.build_request(prompt, overlay)?;
        let started = Instant::now();
        let response = self.send(&request_body).await?;
        Ok(ProviderCall {
            request_body,
            response,
            elapsed: started.elapsed(),
        })
    }
}

/// `{"error": {"message": ...}}` or `{"error": "..."}` at the top level.
pub fn top_level_error(body: &Value) -> Option<String> {
    match body.get("error")? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => Some(
            obj.get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        ),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// DynProvider
// ---------------------------------------------------------------------------

/// Shared, cheaply clonable handle to any adapter.
#[derive(Clone)]
pub struct DynProvider(Arc<dyn ProviderAdapter>);

impl DynProvider {
    pub fn new(provider: impl ProviderAdapter + 'static) -> Self {
        Self(Arc::new(provider))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn config(&self) -> &ProviderConfig {
        self.0.config()
    }

    pub fn response_path(&self) -> Option<&ResponsePath> {
        self.0.response_path()
    }

    pub fn application_error(&self, body: &Value) -> Option<String> {
        self.0.application_error(body)
    }

    pub fn build_request(&self, prompt: &str, overlay: &ParamMap) -> Result<Value> {
        self.0.build_request(prompt, overlay)
    }

    pub async fn send(&self, body: &Value) -> Result<RawResponse> {
        self.0.send(body).await
    }

    pub async fn invoke(&self, prompt: &str, overlay: &ParamMap) -> Result<ProviderCall> {
        self.0.invoke(prompt, overlay).await
    }
}

impl std::fmt::Debug for DynProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DynProvider").field(&self.id()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
