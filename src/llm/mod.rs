//! LLM realtime WebSocket session client.
//!
//! Connection shape is grounded on
//! `examples/other_examples/...openai_realtime.rs.rs`: build the request with
//! `IntoClientRequest`, add the bearer/beta headers, `connect_async`, split
//! the stream, then run a session-config-then-event-loop. That example
//! connects once per utterance; this client is long-lived for the whole
//! call and additionally: (a) keys in-flight tool-call argument
//! accumulation by `call_id` rather than a single pending slot, and (b) sends a WebSocket ping every 25s because a quiet
//! call can easily go longer than the remote's ~60s idle-close window.
//!
//! This system does NOT reconnect the LLM mid-call:
//! on socket error or close during an active conversation the call proceeds
//! deaf until the telephony side or a timer ends it. Re-adding reconnection
//! is a design question, not a defect to copy from anywhere.

pub mod messages;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use messages::{
    ClientEvent, ConversationItem, ContentPart, RealtimeTool, ServerEvent, SessionConfig,
    SessionUpdateBody,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Events surfaced to the pipeline, normalized from the wire protocol in
/// `messages::ServerEvent`.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    TextDelta(String),
    TextDone(String),
    ResponseCreated(String),
    ResponseDone(Value),
    FunctionCall { call_id: String, name: String, args: Value },
    ItemCreated { id: String, role: Option<String> },
    Error(String),
    Closed,
}

struct PendingCall {
    name: String,
    args_buf: String,
}

/// A long-lived session to the LLM for one call. Cloning is cheap (just an
/// mpsc sender); the actual socket is owned by the writer task.
#[derive(Clone)]
pub struct LlmSession {
    tx: mpsc::UnboundedSender<WsMessage>,
}

impl LlmSession {
    /// Connect, send the session configuration, and spawn the reader/writer
    /// tasks. Returns the session handle plus the channel the pipeline reads
    /// normalized events from.
    pub async fn connect(
        url: &str,
        api_key: &str,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LlmEvent>)> {
        let mut request = url.into_client_request().context("building LLM WebSocket request")?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}")).context("invalid API key header")?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws_stream, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .context("LLM WebSocket connect timed out")?
        .context("LLM WebSocket handshake failed")?;

        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<LlmEvent>();

        // Writer task: serializes every outbound frame plus the 25s keepalive
        // ping. Mirrors the sender-task pattern used for the telephony socket
        // (one owner of the write half, fed by a channel).
        tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            ping_interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    msg = out_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if write.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                break;
                            }
                        }
                    }
                    _ = ping_interval.tick() => {
                        if write.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader task: parses server events, accumulates parallel
        // function-call arguments keyed by call_id, and forwards normalized
        // LlmEvents.
        tokio::spawn(async move {
            let mut pending_calls: HashMap<String, PendingCall> = HashMap::new();
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("LLM WebSocket read error: {e}");
                        let _ = event_tx.send(LlmEvent::Error(e.to_string()));
                        break;
                    }
                };
                let text = match msg {
                    WsMessage::Text(t) => t,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };

                let event: ServerEvent = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!("dropping malformed LLM event: {e}");
                        continue;
                    }
                };

                match event {
                    ServerEvent::SessionCreated | ServerEvent::SessionUpdated => {
                        debug!("LLM session configuration acknowledged");
                    }
                    ServerEvent::ResponseCreated { response } => {
                        let _ = event_tx.send(LlmEvent::ResponseCreated(response.id));
                    }
                    ServerEvent::TextDelta { delta } => {
                        let _ = event_tx.send(LlmEvent::TextDelta(delta));
                    }
                    ServerEvent::TextDone { text } => {
                        let _ = event_tx.send(LlmEvent::TextDone(text));
                    }
                    ServerEvent::OutputItemAdded { item } => {
                        if item.kind == "function_call" {
                            if let Some(call_id) = item.call_id {
                                pending_calls.insert(
                                    call_id,
                                    PendingCall { name: item.name.unwrap_or_default(), args_buf: String::new() },
                                );
                            }
                        }
                    }
                    ServerEvent::FunctionCallArgumentsDelta { call_id, delta } => {
                        if let Some(pending) = pending_calls.get_mut(&call_id) {
                            pending.args_buf.push_str(&delta);
                        }
                    }
                    ServerEvent::FunctionCallArgumentsDone { call_id, arguments } => {
                        if let Some(pending) = pending_calls.remove(&call_id) {
                            let raw = arguments.unwrap_or(pending.args_buf);
                            let args: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
                            let _ = event_tx.send(LlmEvent::FunctionCall {
                                call_id,
                                name: pending.name,
                                args,
                            });
                        }
                    }
                    ServerEvent::ResponseDone { response } => {
                        let _ = event_tx.send(LlmEvent::ResponseDone(response));
                    }
                    ServerEvent::ConversationItemCreated { item } => {
                        let _ = event_tx.send(LlmEvent::ItemCreated { id: item.id, role: item.role });
                    }
                    ServerEvent::Error { error } => {
                        let message = error.message.unwrap_or_else(|| "unknown LLM error".to_string());
                        error!("LLM session error: {message}");
                        let _ = event_tx.send(LlmEvent::Error(message));
                    }
                    ServerEvent::Unknown => {}
                }
            }
            info!("LLM WebSocket closed");
            let _ = event_tx.send(LlmEvent::Closed);
        });

        let session = Self { tx: out_tx };
        session.send_session_config(config)?;

        Ok((session, event_rx))
    }

    fn send(&self, event: ClientEvent) -> Result<()> {
        let text = serde_json::to_string(&event).context("serializing LLM client event")?;
        self.tx
            .send(WsMessage::Text(text.into()))
            .map_err(|_| anyhow::anyhow!("LLM WebSocket writer task is gone"))
    }

    fn send_session_config(&self, config: SessionConfig) -> Result<()> {
        self.send(ClientEvent::SessionUpdate {
            session: SessionUpdateBody {
                modalities: vec!["text"],
                instructions: config.instructions,
                turn_detection: None,
                tools: config.tools,
                tool_choice: "auto",
                temperature: config.temperature,
                max_response_output_tokens: config.max_response_output_tokens,
            },
        })
    }

    pub fn send_user_message(&self, text: impl Into<String>) -> Result<()> {
        self.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "user",
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        })?;
        self.send(ClientEvent::ResponseCreate)
    }

    pub fn send_function_result(&self, call_id: impl Into<String>, result: &Value) -> Result<()> {
        let output = serde_json::to_string(result).context("serializing tool result")?;
        self.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput { call_id: call_id.into(), output },
        })?;
        self.send(ClientEvent::ResponseCreate)
    }

    /// Appends a system message without requesting a response — used for
    /// context summarization.
    pub fn inject_context(&self, text: impl Into<String>) -> Result<()> {
        self.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "system",
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        })
    }

    pub fn delete_item(&self, item_id: impl Into<String>) -> Result<()> {
        self.send(ClientEvent::ConversationItemDelete { item_id: item_id.into() })
    }

    pub fn cancel_response(&self) -> Result<()> {
        self.send(ClientEvent::ResponseCancel)
    }

    pub fn close(&self) {
        // Dropping the sender causes the writer task to see `None` and send
        // a close frame; `tx.send` failing here just means it already closed.
        let _ = self.tx.send(WsMessage::Close(None));
    }
}

pub fn build_tools(descriptors: Vec<(String, String, Value)>) -> Vec<RealtimeTool> {
    descriptors
        .into_iter()
        .map(|(name, description, parameters)| RealtimeTool::function(name, description, parameters))
        .collect()
}

#[allow(dead_code)]
fn _assert_session_clone_and_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LlmSession>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_function_call_accumulation_is_keyed_by_call_id() {
        // Interleave argument deltas for two concurrent calls and confirm
        // each resolves independently instead of clobbering a shared slot.
        let mut pending: HashMap<String, PendingCall> = HashMap::new();
        pending.insert("call_a".into(), PendingCall { name: "check_hours".into(), args_buf: String::new() });
        pending.insert("call_b".into(), PendingCall { name: "get_address".into(), args_buf: String::new() });

        pending.get_mut("call_a").unwrap().args_buf.push_str("{\"x\":");
        pending.get_mut("call_b").unwrap().args_buf.push_str("{\"y\":");
        pending.get_mut("call_a").unwrap().args_buf.push_str("1}");
        pending.get_mut("call_b").unwrap().args_buf.push_str("2}");

        let a = pending.remove("call_a").unwrap();
        let b = pending.remove("call_b").unwrap();
        assert_eq!(a.args_buf, "{\"x\":1}");
        assert_eq!(b.args_buf, "{\"y\":2}");
        assert!(pending.is_empty());
    }
}
