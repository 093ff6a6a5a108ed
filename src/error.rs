//! Typed errors at component boundaries.
//!
//! Internal plumbing uses `anyhow::Result` throughout (see the rest of the
//! crate); these enums exist where a *caller* needs to match on the failure
//! kind rather than just log and move on — the GPU client's per-endpoint
//! failure policy and the tool engine's non-fatal HTTP error shape
//! both depend on it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuClientError {
    #[error("request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: &'static str, timeout_ms: u64 },
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned unexpected body: {message}")]
    MalformedResponse { endpoint: &'static str, message: String },
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool {tool} is not enabled for this call")]
    Disabled { tool: String },
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum TelephonySignatureError {
    #[error("missing X-Twilio-Signature header")]
    MissingHeader,
    #[error("signature mismatch")]
    Mismatch,
    #[error("auth token not configured for this account")]
    NoAuthToken,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    #[error("invalid value for environment variable {name}: {value}")]
    InvalidEnvVar { name: &'static str, value: String },
}
