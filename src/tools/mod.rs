//! Tool engine.
//!
//! Built-in tools are hand-coded variants keyed by name; custom tools are
//! data-driven HTTP descriptors configured by the configuration service, not
//! supplied by the LLM. That distinction matters for how much of the
//! teacher's `tools/web.rs` SSRF hardening carries over: the blocked-scheme
//! and blocked-host-pattern checks there exist because that tool lets an LLM
//! fetch an arbitrary caller-supplied URL. Here, custom-tool URL templates
//! come from the trusted configuration service and only the path/query
//! parameter *values* are LLM-supplied, so the scheme/host allowlisting is
//! not reused — see DESIGN.md. The dot-notation extraction and JSON-path
//! handling is new, grounded on the teacher's tool-result shape more loosely
//! than any single function.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCallReason {
    Completed,
    UserRequested,
    NoResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Conference,
    SipRefer,
}

/// Events the tool engine emits back to the pipeline for it to act on.
/// Tool *results* (returned to the LLM) are separate from these — a transfer
/// tool both returns a normal tool result and emits one of these so the
/// pipeline can drive the telephony side.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    EndCallRequested { reason: EndCallReason },
    TransferToNumber {
        phone_number: String,
        transfer_type: TransferType,
        transfer_message: Option<String>,
        enable_client_message: bool,
    },
    TransferToAgent {
        agent_id: String,
        delay_seconds: u32,
        transfer_message: Option<String>,
        first_message: Option<String>,
    },
    LanguageSwitched { language: String, voice: Option<String> },
    /// Voicemail detection is surfaced as a real tool the LLM calls after
    /// speaking the voicemail message, rather than a hidden pipeline-internal
    /// event.
    VoicemailDetected,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub message: Option<String>,
    pub data: Value,
}

impl ToolResult {
    fn ok(data: Value) -> Self {
        Self { success: true, message: None, data }
    }
}

/// A transfer rule matched by `transfer_to_number`'s `condition` argument
/// against the enumerated list configured for the call.
#[derive(Debug, Clone)]
pub struct TransferRule {
    pub phone_number: String,
    pub condition: String,
    pub transfer_type: TransferType,
    pub transfer_message: Option<String>,
    pub enable_client_message: bool,
}

#[derive(Debug, Clone)]
pub struct AgentTransferRule {
    pub agent_id: String,
    pub condition: String,
    pub delay_seconds: u32,
    pub transfer_message: Option<String>,
    pub first_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LanguageVoice {
    pub language: String,
    pub voice: Option<String>,
}

/// Per-call set of enabled built-ins and their enumerated parameters,
/// assembled from the configuration service response.
#[derive(Debug, Clone, Default)]
pub struct BuiltinToolConfig {
    pub end_call_enabled: bool,
    pub transfer_to_number_enabled: bool,
    pub transfer_numbers: Vec<TransferRule>,
    pub transfer_to_agent_enabled: bool,
    pub transfer_agents: Vec<AgentTransferRule>,
    pub switch_language_enabled: bool,
    pub languages: Vec<LanguageVoice>,
    pub voicemail_detection_enabled: bool,
}

/// A custom HTTP tool descriptor.
#[derive(Debug, Clone)]
pub struct CustomToolDescriptor {
    pub name: String,
    pub description: String,
    pub url_template: String,
    pub method: String,
    pub path_params: Vec<ParamSpec>,
    pub query_params: Vec<QueryParamSpec>,
    pub headers: HashMap<String, String>,
    pub response_timeout: Duration,
    /// dot-notation JSON path -> variable name stored on the session.
    pub extract: Vec<(String, String)>,
    /// JSON schema for the arguments the LLM supplies, passed straight
    /// through from the configuration service.
    pub parameters_schema: Value,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    #[allow(dead_code)]
    pub kind: String,
}

#[derive(Debug, Clone)]
pub struct QueryParamSpec {
    pub name: String,
    pub constant: Option<String>,
}

pub fn builtin_tool_schemas(config: &BuiltinToolConfig) -> Vec<(String, String, Value)> {
    let mut tools = Vec::new();

    if config.end_call_enabled {
        tools.push((
            "end_call".to_string(),
            "End the current call.".to_string(),
            serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "enum": ["completed", "user_requested", "no_response"]}
                },
                "required": ["reason"]
            }),
        ));
    }

    if config.transfer_to_number_enabled && !config.transfer_numbers.is_empty() {
        let numbers: Vec<&str> = config.transfer_numbers.iter().map(|r| r.phone_number.as_str()).collect();
        tools.push((
            "transfer_to_number".to_string(),
            "Transfer the call to a phone number.".to_string(),
            serde_json::json!({
                "type": "object",
                "properties": {
                    "phone_number": {"type": "string", "enum": numbers},
                    "condition": {"type": "string"}
                },
                "required": ["phone_number", "condition"]
            }),
        ));
    }

    if config.transfer_to_agent_enabled && !config.transfer_agents.is_empty() {
        let agents: Vec<&str> = config.transfer_agents.iter().map(|r| r.agent_id.as_str()).collect();
        tools.push((
            "transfer_to_agent".to_string(),
            "Transfer the call to another agent.".to_string(),
            serde_json::json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string", "enum": agents},
                    "condition": {"type": "string"}
                },
                "required": ["agent_id", "condition"]
            }),
        ));
    }

    if config.switch_language_enabled && !config.languages.is_empty() {
        let langs: Vec<&str> = config.languages.iter().map(|l| l.language.as_str()).collect();
        tools.push((
            "switch_language".to_string(),
            "Switch the spoken language for the rest of the call.".to_string(),
            serde_json::json!({
                "type": "object",
                "properties": {
                    "language": {"type": "string", "enum": langs}
                },
                "required": ["language"]
            }),
        ));
    }

    if config.voicemail_detection_enabled {
        tools.push((
            "report_voicemail_detected".to_string(),
            "Call this once you determine you have reached voicemail, after speaking the voicemail message.".to_string(),
            serde_json::json!({
                "type": "object",
                "properties": {},
            }),
        ));
    }

    tools
}

/// Executes a built-in tool call, returning the result to report to the LLM
/// plus the event (if any) the pipeline must act on.
pub fn dispatch_builtin(
    name: &str,
    args: &Value,
    config: &BuiltinToolConfig,
) -> Result<(ToolResult, Option<ToolEvent>), ToolError> {
    match name {
        "end_call" => {
            if !config.end_call_enabled {
                return Err(ToolError::Disabled { tool: name.to_string() });
            }
            let reason = match args.get("reason").and_then(Value::as_str) {
                Some("completed") => EndCallReason::Completed,
                Some("user_requested") => EndCallReason::UserRequested,
                Some("no_response") => EndCallReason::NoResponse,
                other => {
                    return Err(ToolError::InvalidArguments {
                        tool: name.to_string(),
                        message: format!("unknown reason: {other:?}"),
                    })
                }
            };
            Ok((
                ToolResult::ok(serde_json::json!({"ended": true})),
                Some(ToolEvent::EndCallRequested { reason }),
            ))
        }
        "transfer_to_number" => {
            if !config.transfer_to_number_enabled {
                return Err(ToolError::Disabled { tool: name.to_string() });
            }
            let phone_number = args
                .get("phone_number")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: name.to_string(),
                    message: "missing phone_number".to_string(),
                })?;
            let rule = config
                .transfer_numbers
                .iter()
                .find(|r| r.phone_number == phone_number)
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: name.to_string(),
                    message: format!("phone_number {phone_number} is not an enumerated transfer target"),
                })?;
            Ok((
                ToolResult::ok(serde_json::json!({"transferring": true})),
                Some(ToolEvent::TransferToNumber {
                    phone_number: rule.phone_number.clone(),
                    transfer_type: rule.transfer_type,
                    transfer_message: rule.transfer_message.clone(),
                    enable_client_message: rule.enable_client_message,
                }),
            ))
        }
        "transfer_to_agent" => {
            if !config.transfer_to_agent_enabled {
                return Err(ToolError::Disabled { tool: name.to_string() });
            }
            let agent_id = args
                .get("agent_id")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: name.to_string(),
                    message: "missing agent_id".to_string(),
                })?;
            let rule = config
                .transfer_agents
                .iter()
                .find(|r| r.agent_id == agent_id)
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: name.to_string(),
                    message: format!("agent_id {agent_id} is not an enumerated transfer target"),
                })?;
            Ok((
                ToolResult::ok(serde_json::json!({"transferring": true})),
                Some(ToolEvent::TransferToAgent {
                    agent_id: rule.agent_id.clone(),
                    delay_seconds: rule.delay_seconds,
                    transfer_message: rule.transfer_message.clone(),
                    first_message: rule.first_message.clone(),
                }),
            ))
        }
        "switch_language" => {
            if !config.switch_language_enabled {
                return Err(ToolError::Disabled { tool: name.to_string() });
            }
            let language = args
                .get("language")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: name.to_string(),
                    message: "missing language".to_string(),
                })?;
            let entry = config
                .languages
                .iter()
                .find(|l| l.language == language)
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: name.to_string(),
                    message: format!("language {language} is not configured"),
                })?;
            Ok((
                ToolResult::ok(serde_json::json!({"language": entry.language})),
                Some(ToolEvent::LanguageSwitched {
                    language: entry.language.clone(),
                    voice: entry.voice.clone(),
                }),
            ))
        }
        "report_voicemail_detected" => {
            if !config.voicemail_detection_enabled {
                return Err(ToolError::Disabled { tool: name.to_string() });
            }
            Ok((ToolResult::ok(serde_json::json!({"acknowledged": true})), Some(ToolEvent::VoicemailDetected)))
        }
        _ => Err(ToolError::UnknownTool(name.to_string())),
    }
}

/// Runs a configured custom HTTP tool call, substituting path parameters
/// into the URL template and forwarding LLM-supplied query parameters
/// alongside any configured constants.
pub async fn dispatch_custom(
    client: &reqwest::Client,
    descriptor: &CustomToolDescriptor,
    args: &Value,
) -> Result<ToolResult, ToolError> {
    let mut url = descriptor.url_template.clone();
    for param in &descriptor.path_params {
        let value = args
            .get(&param.name)
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: descriptor.name.clone(),
                message: format!("missing path parameter {}", param.name),
            })?;
        url = url.replace(&format!("{{{}}}", param.name), &urlencoding_encode(value));
    }

    let mut request = client.request(
        descriptor
            .method
            .parse()
            .unwrap_or(reqwest::Method::GET),
        &url,
    );

    let mut query: Vec<(String, String)> = Vec::new();
    for qp in &descriptor.query_params {
        let value = match &qp.constant {
            Some(c) => Some(c.clone()),
            None => args.get(&qp.name).and_then(Value::as_str).map(str::to_string),
        };
        if let Some(value) = value {
            query.push((qp.name.clone(), value));
        }
    }
    if !query.is_empty() {
        request = request.query(&query);
    }

    for (key, value) in &descriptor.headers {
        request = request.header(key.as_str(), value.as_str());
    }

    let response = request
        .timeout(descriptor.response_timeout)
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            return Ok(ToolResult {
                success: false,
                message: Some(e.to_string()),
                data: serde_json::json!({"status": e.status().map(|s| s.as_u16())}),
            });
        }
    };

    let status = response.status().as_u16();
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Ok(ToolResult {
            success: false,
            message: Some(format!("HTTP {status}")),
            data: serde_json::json!({"status": status, "body": body}),
        });
    }

    let body: Value = response
        .json()
        .await
        .unwrap_or(Value::Null);

    let mut extracted = serde_json::Map::new();
    for (path, var_name) in &descriptor.extract {
        if let Some(value) = extract_dot_path(&body, path) {
            extracted.insert(var_name.clone(), value.clone());
        }
    }

    Ok(ToolResult {
        success: true,
        message: None,
        data: serde_json::json!({
            "status": status,
            "data": body,
            "extracted": extracted,
        }),
    })
}

fn extract_dot_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn urlencoding_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

pub fn build_custom_tool_schema(descriptor: &CustomToolDescriptor, parameters: Value) -> (String, String, Value) {
    (descriptor.name.clone(), descriptor.description.clone(), parameters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> BuiltinToolConfig {
        BuiltinToolConfig {
            end_call_enabled: true,
            transfer_to_number_enabled: true,
            transfer_numbers: vec![TransferRule {
                phone_number: "+15551234567".to_string(),
                condition: "billing issue".to_string(),
                transfer_type: TransferType::SipRefer,
                transfer_message: Some("Transferring you now.".to_string()),
                enable_client_message: true,
            }],
            transfer_to_agent_enabled: false,
            transfer_agents: vec![],
            switch_language_enabled: false,
            languages: vec![],
            voicemail_detection_enabled: false,
        }
    }

    #[test]
    fn voicemail_detected_reports_disabled_when_not_configured() {
        let config = base_config();
        let err =
            dispatch_builtin("report_voicemail_detected", &serde_json::json!({}), &config).unwrap_err();
        assert!(matches!(err, ToolError::Disabled { .. }));
    }

    #[test]
    fn voicemail_detected_emits_event_when_enabled() {
        let mut config = base_config();
        config.voicemail_detection_enabled = true;
        let (_, event) =
            dispatch_builtin("report_voicemail_detected", &serde_json::json!({}), &config).unwrap();
        assert!(matches!(event, Some(ToolEvent::VoicemailDetected)));
    }

    #[test]
    fn end_call_dispatches_requested_reason() {
        let config = base_config();
        let (result, event) =
            dispatch_builtin("end_call", &serde_json::json!({"reason": "user_requested"}), &config).unwrap();
        assert!(result.success);
        assert!(matches!(
            event,
            Some(ToolEvent::EndCallRequested { reason: EndCallReason::UserRequested })
        ));
    }

    #[test]
    fn end_call_disabled_is_an_error() {
        let mut config = base_config();
        config.end_call_enabled = false;
        let err = dispatch_builtin("end_call", &serde_json::json!({"reason": "completed"}), &config).unwrap_err();
        assert!(matches!(err, ToolError::Disabled { .. }));
    }

    #[test]
    fn transfer_carries_transfer_message_through() {
        let config = base_config();
        let (_, event) = dispatch_builtin(
            "transfer_to_number",
            &serde_json::json!({"phone_number": "+15551234567", "condition": "billing issue"}),
            &config,
        )
        .unwrap();
        match event {
            Some(ToolEvent::TransferToNumber { transfer_message, enable_client_message, .. }) => {
                assert_eq!(transfer_message.as_deref(), Some("Transferring you now."));
                assert!(enable_client_message);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn transfer_to_unenumerated_number_is_rejected() {
        let config = base_config();
        let err = dispatch_builtin(
            "transfer_to_number",
            &serde_json::json!({"phone_number": "+19998887777", "condition": "x"}),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn dot_path_extraction_walks_nested_objects() {
        let body = serde_json::json!({"customer": {"id": "c_123", "tier": "gold"}});
        assert_eq!(extract_dot_path(&body, "customer.id").unwrap(), "c_123");
        assert!(extract_dot_path(&body, "customer.missing").is_none());
    }
}
