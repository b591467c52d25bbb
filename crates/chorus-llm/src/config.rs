//! Explicit process configuration and static provider descriptions.
//!
//! [`ChorusConfig`] is built once at startup (usually with
//! [`ChorusConfig::from_env`]) and handed by reference to adapter
//! constructors. Adapters never read the environment themselves.

use std::fmt;
use std::time::Duration;

use chorus_types::{ChorusError, ParamMap, Result};
use chrono::{FixedOffset, Offset};

use crate::extract::ResponsePath;

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct Credentials {
    pub bedrock_api_key: Option<String>,
    pub aws_region: Option<String>,
    pub google_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

impl Credentials {
    pub fn aws_region(&self) -> &str {
        self.aws_region.as_deref().unwrap_or(DEFAULT_REGION)
    }
}

fn redact(v: &Option<String>) -> &'static str {
    if v.is_some() {
        "<set>"
    } else {
        "<unset>"
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bedrock_api_key", &redact(&self.bedrock_api_key))
            .field("aws_region", &self.aws_region())
            .field("google_api_key", &redact(&self.google_api_key))
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("anthropic_api_key", &redact(&self.anthropic_api_key))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ChorusConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChorusConfig {
    pub credentials: Credentials,
    /// Upper bound on a single provider call.
    pub call_timeout: Duration,
    /// Fixed time zone used for record timestamps.
    pub record_offset: FixedOffset,
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            record_offset: utc(),
        }
    }
}

impl ChorusConfig {
    /// Read every setting from the process environment, in one place.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let credentials = Credentials {
            bedrock_api_key: get("AWS_BEARER_TOKEN_BEDROCK"),
            aws_region: get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")),
            google_api_key: get("GOOGLE_API_KEY").or_else(|| get("GEMINI_API_KEY")),
            openai_api_key: get("OPENAI_API_KEY"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
        };

        let call_timeout = match get("CHORUS_CALL_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    ChorusError::Config(format!("CHORUS_CALL_TIMEOUT_SECS is not a number: '{raw}'"))
                })?;
                if secs == 0 {
                    return Err(ChorusError::Config(
                        "CHORUS_CALL_TIMEOUT_SECS must be greater than zero".into(),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_CALL_TIMEOUT,
        };

        let record_offset = match get("CHORUS_UTC_OFFSET") {
            Some(raw) => parse_offset(&raw)?,
            None => utc(),
        };

        Ok(Self {
            credentials,
            call_timeout,
            record_offset,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

fn utc() -> FixedOffset {
    chrono::Utc.fix()
}

/// Parse `Z`, `UTC`, `+HH`, `+HH:MM` or `-HHMM`.
pub fn parse_offset(raw: &str) -> Result<FixedOffset> {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return Ok(utc());
    }
    let bad = || ChorusError::Config(format!("invalid UTC offset '{raw}'"));

    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return Err(bad()),
    };
    let digits = match rest.len() {
        2 | 4 => rest.to_string(),
        5 if rest.as_bytes()[2] == b':' => rest.replacen(':', "", 1),
        _ => return Err(bad()),
    };
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| bad())?;
    let minutes: i32 = if digits.len() == 4 {
        digits[2..].parse().map_err(|_| bad())?
    } else {
        0
    };
    if hours > 23 || minutes > 59 {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

// ---------------------------------------------------------------------------
// ProviderConfig
// ---------------------------------------------------------------------------

/// How a provider endpoint authenticates requests.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Bearer(String),
    Header { name: String, value: String },
    /// API key passed as the `key` query parameter.
    QueryKey(String),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Bearer(_) => f.write_str("Bearer(***)"),
            Auth::Header { name, .. } => write!(f, "Header({name}: ***)"),
            Auth::QueryKey(_) => f.write_str("QueryKey(***)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub auth: Auth,
}

/// Static description of one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub defaults: ParamMap,
    pub endpoint: Endpoint,
    /// `None` when the provider's response shape is unknown.
    pub response_path: Option<ResponsePath>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            id: id.into(),
            defaults: ParamMap::new(),
            endpoint,
            response_path: None,
        }
    }

    /// Default parameters from a JSON object literal; non-objects are ignored.
    pub fn with_defaults(mut self, defaults: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = defaults {
            self.defaults = map;
        }
        self
    }

    pub fn with_response_path(mut self, path: ResponsePath) -> Self {
        self.response_path = Some(path);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = ChorusConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.credentials.bedrock_api_key.is_none());
        assert_eq!(config.credentials.aws_region(), "us-east-1");
        assert_eq!(config.call_timeout, Duration::from_secs(60));
        assert_eq!(config.record_offset.local_minus_utc(), 0);
    }

    #[test]
    fn reads_credentials_with_fallback_names() {
        let config = ChorusConfig::from_lookup(lookup(&[
            ("AWS_BEARER_TOKEN_BEDROCK", "bedrock-key"),
            ("AWS_DEFAULT_REGION", "eu-west-1"),
            ("GEMINI_API_KEY", "gem-key"),
            ("OPENAI_API_KEY", ""),
        ]))
        .unwrap();
        assert_eq!(config.credentials.bedrock_api_key.as_deref(), Some("bedrock-key"));
        assert_eq!(config.credentials.aws_region(), "eu-west-1");
        assert_eq!(config.credentials.google_api_key.as_deref(), Some("gem-key"));
        assert!(config.credentials.openai_api_key.is_none(), "empty counts as unset");
    }

    #[test]
    fn timeout_and_offset_are_parsed() {
        let config = ChorusConfig::from_lookup(lookup(&[
            ("CHORUS_CALL_TIMEOUT_SECS", "15"),
            ("CHORUS_UTC_OFFSET", "+02:00"),
        ]))
        .unwrap();
        assert_eq!(config.call_timeout, Duration::from_secs(15));
        assert_eq!(config.record_offset.local_minus_utc(), 7200);
    }

    #[test]
    fn bad_timeout_is_config_error() {
        let err = ChorusConfig::from_lookup(lookup(&[("CHORUS_CALL_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ChorusError::Config(_)));
        assert!(ChorusConfig::from_lookup(lookup(&[("CHORUS_CALL_TIMEOUT_SECS", "0")])).is_err());
    }

    #[test]
    fn offsets() {
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("-0530").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_offset("+03").unwrap().local_minus_utc(), 3 * 3600);
        assert!(parse_offset("02:00").is_err());
        assert!(parse_offset("+25:00").is_err());
        assert!(parse_offset("+2:0").is_err());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let creds = Credentials {
            openai_api_key: Some("sk-secret".into()),
            ..Default::default()
        };
        let rendered = format!("{creds:?} {:?}", Auth::Bearer("sk-secret".into()));
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<set>"));
    }
}
