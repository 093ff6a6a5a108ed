//! Wire shapes for the LLM realtime WebSocket.
//!
//! Deserialization follows the tagged-enum style already used for the
//! teacher's `ClientMessage`/`ServerMessage` in `realtime_voice.rs`, and the
//! lenient-field conventions from `agent/llm.rs` (optional fields default
//! rather than fail deserialization, since different provider versions add
//! fields over time).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool descriptor as sent in `session.update.tools`. Flat shape (not
/// nested under a `function` object) — the realtime session protocol's tool
/// list differs from the chat-completions `ToolDefinition`/`FunctionDefinition`
/// split the teacher's HTTP client used.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeTool {
 #[serde(rename = "type")]
 pub kind: &'static str,
 pub name: String,
 pub description: String,
 pub parameters: Value,
}

impl RealtimeTool {
 pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
 Self { kind: "function", name: name.into(), description: description.into(), parameters }
 }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
 pub instructions: String,
 pub tools: Vec<RealtimeTool>,
 pub temperature: f32,
 pub max_response_output_tokens: u32,
}

/// Outbound client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
 #[serde(rename = "session.update")]
 SessionUpdate { session: SessionUpdateBody },
 #[serde(rename = "conversation.item.create")]
 ConversationItemCreate { item: ConversationItem },
 #[serde(rename = "conversation.item.delete")]
 ConversationItemDelete { item_id: String },
 #[serde(rename = "response.create")]
 ResponseCreate,
 #[serde(rename = "response.cancel")]
 ResponseCancel,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdateBody {
 pub modalities: Vec<&'static str>,
 pub instructions: String,
 /// Server-side turn detection is always disabled — this system runs its
 /// own VAD/smart-turn pipeline over the telephony audio.
 pub turn_detection: Option<Value>,
 pub tools: Vec<RealtimeTool>,
 pub tool_choice: &'static str,
 pub temperature: f32,
 pub max_response_output_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
 #[serde(rename = "message")]
 Message { role: &'static str, content: Vec<ContentPart> },
 #[serde(rename = "function_call_output")]
 FunctionCallOutput { call_id: String, output: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
 #[serde(rename = "input_text")]
 InputText { text: String },
}

/// Inbound server events. Only the fields this pipeline consumes are
/// modeled; unrecognized event types fall through to `Unknown` and are
/// logged, not treated as a protocol error.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
 #[serde(rename = "session.created")]
 SessionCreated,
 #[serde(rename = "session.updated")]
 SessionUpdated,
 #[serde(rename = "response.created")]
 ResponseCreated { response: ResponseRef },
 #[serde(rename = "response.text.delta")]
 TextDelta { delta: String },
 #[serde(rename = "response.text.done")]
 TextDone { text: String },
 #[serde(rename = "response.output_item.added")]
 OutputItemAdded { item: OutputItem },
 #[serde(rename = "response.function_call_arguments.delta")]
 FunctionCallArgumentsDelta { call_id: String, delta: String },
 #[serde(rename = "response.function_call_arguments.done")]
 FunctionCallArgumentsDone {
 call_id: String,
 #[serde(default)]
 arguments: Option<String>,
 },
 #[serde(rename = "response.done")]
 ResponseDone { response: Value },
 #[serde(rename = "conversation.item.created")]
 ConversationItemCreated { item: ItemRef },
 #[serde(rename = "error")]
 Error { error: ErrorBody },
 #[serde(other)]
 Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseRef {
 pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputItem {
 #[serde(rename = "type")]
 pub kind: String,
 #[serde(default)]
 pub call_id: Option<String>,
 #[serde(default)]
 pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemRef {
 pub id: String,
 #[serde(default)]
 pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
 #[serde(default)]
 pub message: Option<String>,
}
