//! Provider adapters for Chorus (Bedrock, Gemini, OpenAI, Anthropic).
//!
//! Provides the `ProviderAdapter` trait, the `DynProvider` wrapper, recursive
//! parameter merging, path-based response extraction, explicit provider
//! configuration, and a `ProviderRegistry` built from a `ChorusConfig`.

#[cfg(feature = "providers")]
mod anthropic;
#[cfg(feature = "providers")]
mod bedrock;
pub mod config;
pub mod extract;
#[cfg(feature = "providers")]
mod gemini;
#[cfg(feature = "providers")]
mod http;
#[cfg(feature = "providers")]
mod openai;
pub mod params;
mod provider;
#[cfg(feature = "providers")]
mod registry;

#[cfg(feature = "providers")]
pub use anthropic::AnthropicAdapter;
#[cfg(feature = "providers")]
pub use bedrock::{BedrockAdapter, BedrockModel};
pub use config::{Auth, ChorusConfig, Credentials, Endpoint, ProviderConfig};
pub use extract::{extract, extract_for, PathSegment, ResponsePath};
#[cfg(feature = "providers")]
pub use gemini::GeminiAdapter;
#[cfg(feature = "providers")]
pub use openai::OpenAiAdapter;
pub use params::merge_parameters;
pub use provider::*;
#[cfg(feature = "providers")]
pub use registry::ProviderRegistry;
