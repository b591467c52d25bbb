//! Shared types and errors for the Chorus multi-provider dispatcher.
//!
//! This crate provides the foundational types used across all other Chorus crates:
//! - `ChorusError`: unified error taxonomy and its outcome classification
//! - `Prompt`: generated prompt text plus the metadata persisted alongside it
//! - `InvocationOutcome`: result of one provider invocation within a batch
//! - `ResultRecord`: the append-only persisted shape of an outcome

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Unified error type for all Chorus subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ChorusError {
    // === Provider call errors ===
    #[error("Transport failure calling {provider}: {message}")]
    Transport { provider: String, message: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Could not build request for {provider}: {message}")]
    InvalidRequest { provider: String, message: String },

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    // === Configuration / persistence ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Result sink error: {0}")]
    Sink(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ChorusError {
    /// The classification stored on an outcome when this error ends a provider task.
    pub fn class(&self) -> ErrorClass {
        match self {
            ChorusError::Transport { .. } | ChorusError::RequestTimeout { .. } => {
                ErrorClass::Transport
            }
            ChorusError::ProviderError { .. } | ChorusError::AuthError { .. } => {
                ErrorClass::Provider
            }
            _ => ErrorClass::Internal,
        }
    }

    /// Returns `true` if no response body existed when the error occurred.
    pub fn is_transport(&self) -> bool {
        self.class() == ErrorClass::Transport
    }
}

/// A convenience alias for `Result<T, ChorusError>`.
pub type Result<T> = std::result::Result<T, ChorusError>;

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network/HTTP failure (or timeout) before any response body existed.
    Transport,
    /// The provider answered but signaled a failure.
    Provider,
    /// The task itself failed: request building, unknown configuration, or a panic.
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transport => "transport",
            ErrorClass::Provider => "provider",
            ErrorClass::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error marker attached to an outcome whose invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub class: ErrorClass,
    pub message: String,
}

impl OutcomeError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl From<&ChorusError> for OutcomeError {
    fn from(err: &ChorusError) -> Self {
        Self::new(err.class(), err.to_string())
    }
}

impl fmt::Display for OutcomeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

// ---------------------------------------------------------------------------
// ParamMap
// ---------------------------------------------------------------------------

/// Provider parameters (defaults or a caller overlay).
pub type ParamMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Metadata recorded next to a prompt. Never sent to providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptMetadata {
    pub sentiment: Option<String>,
    /// Category name -> chosen topic, in the order the topics were drawn.
    #[serde(default)]
    pub categories: serde_json::Map<String, serde_json::Value>,
}

/// A generated prompt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    text: String,
    metadata: PromptMetadata,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: PromptMetadata::default(),
        }
    }

    pub fn with_metadata(text: impl Into<String>, metadata: PromptMetadata) -> Self {
        Self {
            text: text.into(),
            metadata,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn metadata(&self) -> &PromptMetadata {
        &self.metadata
    }

    /// Category mapping rendered as JSON text, non-ASCII preserved.
    pub fn categories_json(&self) -> String {
        serde_json::to_string(&self.metadata.categories).unwrap_or_else(|_| "{}".to_string())
    }
}

// ---------------------------------------------------------------------------
// Extraction result
// ---------------------------------------------------------------------------

/// Why text could not be extracted from a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionFailure {
    /// The declared path could not be walked to a text leaf.
    Path,
    /// The provider declared no extraction path.
    UnsupportedProvider,
    /// The invocation failed before a response existed.
    NoResponse,
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtractionFailure::Path => "path extraction error",
            ExtractionFailure::UnsupportedProvider => "unsupported provider",
            ExtractionFailure::NoResponse => "no response",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Extracted {
    Text(String),
    Failed(ExtractionFailure),
}

impl Extracted {
    pub fn text(&self) -> Option<&str> {
        match self {
            Extracted::Text(t) => Some(t),
            Extracted::Failed(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Extracted::Text(_))
    }
}

/// Stored verbatim: either the extracted text or the failure marker.
impl fmt::Display for Extracted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extracted::Text(t) => f.write_str(t),
            Extracted::Failed(failure) => write!(f, "{failure}"),
        }
    }
}

// ---------------------------------------------------------------------------
// InvocationOutcome
// ---------------------------------------------------------------------------

/// The result of one adapter invocation within a batch, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub provider: String,
    pub extracted: Extracted,
    /// Decoded response body, or the synthetic error shape on HTTP failure.
    pub raw_response: serde_json::Value,
    /// Serialized request body, empty when the request could not be built.
    pub request_body: String,
    pub elapsed: Duration,
    pub error: Option<OutcomeError>,
}

impl InvocationOutcome {
    /// Outcome for a task that failed before any response existed.
    pub fn failed(
        provider: impl Into<String>,
        request_body: impl Into<String>,
        elapsed: Duration,
        error: OutcomeError,
    ) -> Self {
        Self {
            provider: provider.into(),
            extracted: Extracted::Failed(ExtractionFailure::NoResponse),
            raw_response: serde_json::json!({ "error": error.message }),
            request_body: request_body.into(),
            elapsed,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.extracted.is_text()
    }
}

// ---------------------------------------------------------------------------
// FixedSeconds
// ---------------------------------------------------------------------------

/// A duration stored as a fixed-point decimal number of seconds with
/// millisecond precision, serialized as text (`"1.250"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FixedSeconds {
    millis: u64,
}

impl FixedSeconds {
    pub fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    pub fn as_millis(&self) -> u64 {
        self.millis
    }
}

impl From<Duration> for FixedSeconds {
    fn from(d: Duration) -> Self {
        Self::from_millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for FixedSeconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.millis / 1000, self.millis % 1000)
    }
}

impl std::str::FromStr for FixedSeconds {
    type Err = ChorusError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || ChorusError::Other(format!("invalid fixed-point seconds '{s}'"));
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        if frac.len() > 3 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(bad());
        }
        let whole: u64 = whole.parse().map_err(|_| bad())?;
        let frac_ms: u64 = if frac.is_empty() {
            0
        } else {
            format!("{frac:0<3}").parse().map_err(|_| bad())?
        };
        whole
            .checked_mul(1000)
            .and_then(|ms| ms.checked_add(frac_ms))
            .map(Self::from_millis)
            .ok_or_else(bad)
    }
}

impl Serialize for FixedSeconds {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FixedSeconds {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// ResultRecord
// ---------------------------------------------------------------------------

/// One persisted invocation. `(model, timestamp)` is the natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub model: String,
    pub timestamp: String,
    pub batch_id: uuid::Uuid,
    pub sentiment: Option<String>,
    pub categories: String,
    pub prompt: String,
    pub run_time: FixedSeconds,
    pub response: String,
    pub request_body: String,
    pub full_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultRecord {
    /// Package an outcome for storage. `timestamp` is assigned by the caller at
    /// write time.
    pub fn from_outcome(
        outcome: &InvocationOutcome,
        prompt: &Prompt,
        batch_id: uuid::Uuid,
        timestamp: chrono::DateTime<chrono::FixedOffset>,
    ) -> Self {
        Self {
            model: outcome.provider.clone(),
            timestamp: timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, false),
            batch_id,
            sentiment: prompt.metadata().sentiment.clone(),
            categories: prompt.categories_json(),
            prompt: prompt.text().to_string(),
            run_time: FixedSeconds::from(outcome.elapsed),
            response: outcome.extracted.to_string(),
            request_body: outcome.request_body.clone(),
            full_response: outcome.raw_response.to_string(),
            error: outcome.error.as_ref().map(ToString::to_string),
        }
    }

    /// The `(model, timestamp)` uniqueness key.
    pub fn key(&self) -> (&str, &str) {
        (&self.model, &self.timestamp)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn error_classes() {
        let transport = ChorusError::Transport {
            provider: "p".into(),
            message: "refused".into(),
        };
        assert_eq!(transport.class(), ErrorClass::Transport);
        assert!(transport.is_transport());

        let timeout = ChorusError::RequestTimeout {
            provider: "p".into(),
            timeout_ms: 10,
        };
        assert_eq!(timeout.class(), ErrorClass::Transport);

        let provider = ChorusError::ProviderError {
            provider: "p".into(),
            status: 200,
            message: "blocked".into(),
        };
        assert_eq!(provider.class(), ErrorClass::Provider);

        assert_eq!(ChorusError::Config("x".into()).class(), ErrorClass::Internal);
    }

    #[test]
    fn outcome_error_display_includes_class() {
        let err = OutcomeError::new(ErrorClass::Provider, "HTTP 500");
        assert_eq!(err.to_string(), "provider: HTTP 500");
    }

    #[test]
    fn extracted_display_is_text_or_marker() {
        assert_eq!(Extracted::Text("Hello".into()).to_string(), "Hello");
        assert_eq!(
            Extracted::Failed(ExtractionFailure::Path).to_string(),
            "path extraction error"
        );
        assert_eq!(
            Extracted::Failed(ExtractionFailure::UnsupportedProvider).to_string(),
            "unsupported provider"
        );
    }

    #[test]
    fn fixed_seconds_formats_three_decimals() {
        assert_eq!(FixedSeconds::from(Duration::from_millis(1250)).to_string(), "1.250");
        assert_eq!(FixedSeconds::from(Duration::from_millis(7)).to_string(), "0.007");
        assert_eq!(FixedSeconds::from_millis(0).to_string(), "0.000");
    }

    #[test]
    fn fixed_seconds_parses() {
        assert_eq!("1.25".parse::<FixedSeconds>().unwrap().as_millis(), 1250);
        assert_eq!("3".parse::<FixedSeconds>().unwrap().as_millis(), 3000);
        assert!("1.2345".parse::<FixedSeconds>().is_err());
        assert!("abc".parse::<FixedSeconds>().is_err());
        assert!("1.-5".parse::<FixedSeconds>().is_err());
    }

    #[test]
    fn fixed_seconds_serializes_as_decimal_text() {
        let json = serde_json::to_string(&FixedSeconds::from_millis(842)).unwrap();
        assert_eq!(json, "\"0.842\"");
        let back: FixedSeconds = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_millis(), 842);
    }

    #[test]
    fn prompt_categories_json_keeps_unicode() {
        let mut meta = PromptMetadata {
            sentiment: Some("positive".into()),
            ..Default::default()
        };
        meta.categories.insert("Lieu".into(), "café".into());
        let prompt = Prompt::with_metadata("hi", meta);
        assert_eq!(prompt.categories_json(), r#"{"Lieu":"café"}"#);
    }

    #[test]
    fn prompt_categories_json_keeps_insertion_order() {
        let mut meta = PromptMetadata::default();
        meta.categories.insert("Weather".into(), "Rain".into());
        meta.categories.insert("Art".into(), "Jazz".into());
        meta.categories.insert("Motion".into(), "Trains".into());
        let prompt = Prompt::with_metadata("hi", meta);
        assert_eq!(
            prompt.categories_json(),
            r#"{"Weather":"Rain","Art":"Jazz","Motion":"Trains"}"#
        );
    }

    #[test]
    fn record_from_failed_outcome_stores_marker_and_error() {
        let outcome = InvocationOutcome::failed(
            "amazon.titan-text-express-v1",
            "{}",
            Duration::from_millis(1500),
            OutcomeError::new(ErrorClass::Transport, "connection reset"),
        );
        let prompt = Prompt::new("Write a sentence");
        let offset = chrono::FixedOffset::east_opt(2 * 3600).unwrap();
        let ts = offset.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let record = ResultRecord::from_outcome(&outcome, &prompt, uuid::Uuid::nil(), ts);
        assert_eq!(record.model, "amazon.titan-text-express-v1");
        assert_eq!(record.timestamp, "2024-03-01T12:00:00.000000+02:00");
        assert_eq!(record.response, "no response");
        assert_eq!(record.run_time.to_string(), "1.500");
        assert_eq!(record.error.as_deref(), Some("transport: connection reset"));
        assert_eq!(record.categories, "{}");
        assert!(record.full_response.contains("connection reset"));
        assert_eq!(record.key(), ("amazon.titan-text-express-v1", record.timestamp.as_str()));
    }

    #[test]
    fn successful_outcome_is_success() {
        let outcome = InvocationOutcome {
            provider: "p".into(),
            extracted: Extracted::Text("ok".into()),
            raw_response: serde_json::json!({}),
            request_body: "{}".into(),
            elapsed: Duration::ZERO,
            error: None,
        };
        assert!(outcome.is_success());
    }
}
