//! Internal configuration service client.
//!
//! Shape mirrors `messaging/slack.rs`'s `SlackClient`: a config struct plus a
//! thin `reqwest::Client` wrapper with one method per endpoint, each request
//! carrying the shared-secret header rather than a bearer token.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingCallResponse {
    pub assistant_id: Option<String>,
    pub organization_id: Option<String>,
    pub twilio_auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferNumberRule {
    pub phone_number: String,
    pub condition: String,
    pub transfer_type: String,
    pub transfer_message: Option<String>,
    #[serde(default)]
    pub enable_client_message: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferAgentRule {
    pub agent_id: String,
    pub condition: String,
    #[serde(default)]
    pub delay_seconds: u32,
    pub transfer_message: Option<String>,
    pub first_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomToolConfig {
    pub name: String,
    pub description: String,
    pub url_template: String,
    pub method: String,
    #[serde(default)]
    pub path_params: Vec<Value>,
    #[serde(default)]
    pub query_params: Vec<Value>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_tool_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub extract: Vec<(String, String)>,
    #[serde(default)]
    pub parameters_schema: Value,
}

fn default_tool_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    pub system_prompt: String,
    pub first_message: String,
    pub voicemail_message: Option<String>,
    pub language: String,
    pub voice: Option<String>,
    #[serde(default)]
    pub language_voices: HashMap<String, Option<String>>,
    pub silence_timeout_seconds: u64,
    pub max_duration_seconds: u64,
    #[serde(default)]
    pub end_call_allowed: bool,
    #[serde(default)]
    pub transfer_to_number_allowed: bool,
    #[serde(default)]
    pub transfer_to_agent_allowed: bool,
    #[serde(default)]
    pub custom_tools_allowed: bool,
    #[serde(default)]
    pub language_detection: bool,
    #[serde(default)]
    pub voicemail_detection: bool,
    #[serde(default)]
    pub enable_filler_phrases: bool,
    #[serde(default)]
    pub filler_phrases: Vec<String>,
    #[serde(default)]
    pub context_summarization: bool,
    #[serde(default)]
    pub transfer_numbers: Vec<TransferNumberRule>,
    #[serde(default)]
    pub transfer_agents: Vec<TransferAgentRule>,
    #[serde(default)]
    pub custom_tools: Vec<CustomToolConfig>,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptLine {
    pub role: &'static str,
    pub message: String,
    pub time_in_call_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallCompletePayload {
    pub call_sid: String,
    pub assistant_id: String,
    pub organization_id: String,
    pub status: &'static str,
    pub end_reason: String,
    pub duration_seconds: u64,
    pub transcript: Vec<TranscriptLine>,
    pub dynamic_variables: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferAgentWebhook {
    pub twiml_url: String,
}

pub struct ConfigServiceClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

impl ConfigServiceClient {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            secret: secret.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn incoming_call(
        &self,
        call_sid: &str,
        from: &str,
        to: &str,
    ) -> Result<IncomingCallResponse> {
        let resp = self
            .http
            .post(self.url("/calls/incoming"))
            .header("X-Internal-Secret", &self.secret)
            .timeout(REQUEST_TIMEOUT)
            .json(&serde_json::json!({"call_sid": call_sid, "from": from, "to": to}))
            .send()
            .await
            .context("calling configuration service for incoming call")?;

        resp.json::<IncomingCallResponse>()
            .await
            .context("parsing configuration service incoming-call response")
    }

    pub async fn call_config(&self, call_sid: &str) -> Result<AssistantConfig> {
        let resp = self
            .http
            .get(self.url(&format!("/calls/{call_sid}/config")))
            .header("X-Internal-Secret", &self.secret)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("fetching call configuration")?;

        if !resp.status().is_success() {
            bail!("configuration service returned {} for call config", resp.status());
        }

        resp.json::<AssistantConfig>()
            .await
            .context("parsing call configuration response")
    }

    /// Terminal completion callback. Best-effort: failures
    /// are logged by the caller and never re-attempted.
    pub async fn complete_call(&self, payload: &CallCompletePayload) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/calls/{}/complete", payload.call_sid)))
            .header("X-Internal-Secret", &self.secret)
            .timeout(REQUEST_TIMEOUT)
            .json(payload)
            .send()
            .await
            .context("posting call completion")?;

        if !resp.status().is_success() {
            bail!("configuration service returned {} for call completion", resp.status());
        }
        Ok(())
    }

    pub async fn call_status(&self, call_sid: &str, status: &str, duration_seconds: Option<u64>) -> Result<()> {
        self.http
            .post(self.url("/calls/status"))
            .header("X-Internal-Secret", &self.secret)
            .timeout(REQUEST_TIMEOUT)
            .json(&serde_json::json!({
                "call_sid": call_sid,
                "call_status": status,
                "call_duration": duration_seconds,
            }))
            .send()
            .await
            .context("posting call status")?;
        Ok(())
    }

    pub async fn transfer_agent_webhook(&self, call_sid: &str, agent_id: &str) -> Result<String> {
        let resp = self
            .http
            .get(self.url(&format!("/calls/{call_sid}/transfer-agent")))
            .query(&[("agent_id", agent_id)])
            .header("X-Internal-Secret", &self.secret)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("resolving transfer-agent webhook")?;

        let body: TransferAgentWebhook = resp.json().await.context("parsing transfer-agent webhook response")?;
        Ok(body.twiml_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_trims_trailing_slash_on_base() {
        let client = ConfigServiceClient::new("http://config.internal/", "secret");
        assert_eq!(client.url("/calls/status"), "http://config.internal/calls/status");
    }

    #[test]
    fn assistant_config_deserializes_with_optional_fields_defaulted() {
        let json = serde_json::json!({
            "system_prompt": "You are helpful.",
            "first_message": "Hello!",
            "voicemail_message": null,
            "language": "en",
            "voice": null,
            "silence_timeout_seconds": 30,
            "max_duration_seconds": 1800,
            "twilio_account_sid": "ACxxx",
            "twilio_auth_token": "tokxxx",
        });
        let config: AssistantConfig = serde_json::from_value(json).unwrap();
        assert!(!config.end_call_allowed);
        assert!(config.transfer_numbers.is_empty());
    }
}
