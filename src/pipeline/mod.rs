//! Per-call orchestration: wires the telephony audio stream, the
//! GPU-backed turn-taking state machine, the LLM session, and the tool
//! engine into a single task that runs for the life of one call.
//!
//! The task-per-call shape — one spawned future driving one `CallSession`
//! until cleanup, with its own inbox — is grounded on the donor's
//! `server/realtime_voice.rs` `handle_voice_session` (split socket, a writer
//! task fed by a channel, and a read loop that owns the session). What's new
//! here is the fan-out from that one read loop into three concurrent
//! concerns (VAD/turn-taking, the LLM event stream, and the tool engine)
//! rather than one request/response cycle per utterance.

pub mod sentence;
pub mod turn_taking;
pub mod tts_queue;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IndexedRandom;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::OpenAiConfig;
use crate::configservice::{
    AssistantConfig, CallCompletePayload, ConfigServiceClient, TransferAgentRule, TransferNumberRule,
    TranscriptLine,
};
use crate::gpu::GpuClient;
use crate::llm::messages::SessionConfig;
use crate::llm::{build_tools, LlmEvent, LlmSession};
use crate::server::AppState;
use crate::session::{CallConfig, CallRegistry, CallSession, CallStatus, TelephonyCredentials};
use crate::telephony::stream::InboundEvent;
use crate::telephony::{self, PendingCall, TelephonyRestClient};
use crate::tools::{
    self, BuiltinToolConfig, CustomToolDescriptor, EndCallReason, LanguageVoice, ParamSpec,
    QueryParamSpec, ToolEvent, TransferType,
};

/// Out-of-band summarization triggers once the tracked transcript
/// crosses this many words.
const WORD_COUNT_SUMMARIZATION_THRESHOLD: usize = 1500;
const DEFAULT_FILLER_PHRASES: &[&str] = &["One moment.", "Let me check on that."];
const TTS_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TTS_DRAIN_MAX_WAIT: Duration = Duration::from_secs(10);

/// Resources shared by every helper below, built once the configuration
/// service has resolved the call.
struct Ctx {
    gpu: Arc<GpuClient>,
    configservice: Arc<ConfigServiceClient>,
    registry: Arc<CallRegistry>,
    tool_http: reqwest::Client,
    openai: OpenAiConfig,
    telephony_rest: TelephonyRestClient,
}

/// Entry point spawned once per audio WebSocket connection
/// (`telephony::stream::handle_media_stream`). Resolves configuration,
/// opens the LLM session, builds and registers the `CallSession`, and then
/// drives the call until it ends.
pub async fn run_call(
    state: AppState,
    call_sid: String,
    caller_number: String,
    pending: Option<PendingCall>,
    stream_sid_rx: oneshot::Receiver<String>,
    mut inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
    telephony_tx: mpsc::UnboundedSender<axum::extract::ws::Message>,
) {
    let Some(pending) = pending else {
        warn!(call_sid = %call_sid, "no pending call record for incoming audio stream; dropping");
        return;
    };

    let assistant_config = match state.configservice.call_config(&call_sid).await {
        Ok(c) => c,
        Err(e) => {
            error!(call_sid = %call_sid, error = %e, "failed to fetch call configuration, abandoning call");
            return;
        }
    };

    let telephony_rest = TelephonyRestClient::new(
        assistant_config.twilio_account_sid.clone(),
        assistant_config.twilio_auth_token.clone(),
    );
    let ctx = Arc::new(Ctx {
        gpu: state.gpu.clone(),
        configservice: state.configservice.clone(),
        registry: state.registry.clone(),
        tool_http: state.tool_http.clone(),
        openai: state.config.openai.clone(),
        telephony_rest,
    });

    let call_config = build_call_config(&pending, &assistant_config);
    let first_message = call_config.first_message.clone();

    let tool_schemas: Vec<(String, String, serde_json::Value)> = tools::builtin_tool_schemas(&call_config.builtin_tools)
        .into_iter()
        .chain(
            call_config
                .custom_tools
                .iter()
                .map(|d| tools::build_custom_tool_schema(d, d.parameters_schema.clone())),
        )
        .collect();

    let session_config = SessionConfig {
        instructions: call_config.system_prompt.clone(),
        tools: build_tools(tool_schemas),
        temperature: ctx.openai.temperature,
        max_response_output_tokens: ctx.openai.max_tokens,
    };

    let (llm, mut llm_events) =
        match LlmSession::connect(&ctx.openai.realtime_ws_url(), &ctx.openai.api_key, session_config).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(call_sid = %call_sid, error = %e, "failed to connect LLM session, abandoning call");
                return;
            }
        };

    let stream_sid = match stream_sid_rx.await {
        Ok(sid) => sid,
        Err(_) => {
            error!(call_sid = %call_sid, "telephony stream closed before sending a start event");
            llm.close();
            return;
        }
    };

    let (tts_tx, session_tx) =
        tts_queue::spawn(call_sid.clone(), stream_sid.clone(), ctx.gpu.clone(), telephony_tx.clone());

    let telephony_credentials = TelephonyCredentials {
        account_sid: assistant_config.twilio_account_sid.clone(),
        auth_token: assistant_config.twilio_auth_token.clone(),
    };

    let session = CallSession::new(
        call_sid.clone(),
        caller_number,
        uuid::Uuid::new_v4().to_string(),
        call_config,
        telephony_credentials,
        telephony_tx,
        llm,
        stream_sid,
        tts_tx,
    );

    if session_tx.send(session.clone()).is_err() {
        error!(call_sid = %call_sid, "TTS queue task exited before the session could attach");
        return;
    }

    ctx.registry.register(session.clone()).await;
    session.set_status(CallStatus::Active).await;

    if !first_message.trim().is_empty() {
        enqueue_speech(&session, first_message).await;
    }

    let llm_ctx = ctx.clone();
    let llm_session = session.clone();
    let llm_task = tokio::spawn(async move {
        while let Some(event) = llm_events.recv().await {
            handle_llm_event(&llm_session, &llm_ctx, event).await;
        }
    });

    drive_call(&session, &ctx, &mut inbound_rx).await;

    llm_task.abort();
    cleanup(&session, &ctx, "pipeline_ended").await;
}

/// Converts the configuration service's response into the session's
/// immutable configuration snapshot, translating each provider-rule
/// list into the shape the tool engine expects.
fn build_call_config(pending: &PendingCall, cfg: &AssistantConfig) -> CallConfig {
    let builtin_tools = BuiltinToolConfig {
        end_call_enabled: cfg.end_call_allowed,
        transfer_to_number_enabled: cfg.transfer_to_number_allowed,
        transfer_numbers: cfg.transfer_numbers.iter().map(convert_transfer_number_rule).collect(),
        transfer_to_agent_enabled: cfg.transfer_to_agent_allowed,
        transfer_agents: cfg.transfer_agents.iter().map(convert_transfer_agent_rule).collect(),
        switch_language_enabled: cfg.language_detection,
        languages: cfg
            .language_voices
            .iter()
            .map(|(language, voice)| LanguageVoice { language: language.clone(), voice: voice.clone() })
            .collect(),
        voicemail_detection_enabled: cfg.voicemail_detection,
    };

    let custom_tools = if cfg.custom_tools_allowed {
        cfg.custom_tools.iter().map(convert_custom_tool).collect()
    } else {
        Vec::new()
    };

    let filler_phrases = if cfg.filler_phrases.is_empty() {
        DEFAULT_FILLER_PHRASES.iter().map(|s| s.to_string()).collect()
    } else {
        cfg.filler_phrases.clone()
    };

    CallConfig {
        assistant_id: pending.assistant_id.clone(),
        organization_id: pending.organization_id.clone(),
        system_prompt: cfg.system_prompt.clone(),
        language: cfg.language.clone(),
        voice: cfg.voice.clone(),
        language_voice_map: cfg.language_voices.clone(),
        silence_hangup_seconds: cfg.silence_timeout_seconds,
        max_call_duration_seconds: cfg.max_duration_seconds,
        end_call_allowed: cfg.end_call_allowed,
        transfer_to_number_allowed: cfg.transfer_to_number_allowed,
        transfer_to_agent_allowed: cfg.transfer_to_agent_allowed,
        custom_tools_allowed: cfg.custom_tools_allowed,
        language_detection: cfg.language_detection,
        voicemail_detection: cfg.voicemail_detection,
        filler_phrases_enabled: cfg.enable_filler_phrases,
        context_summarization_enabled: cfg.context_summarization,
        first_message: cfg.first_message.clone(),
        voicemail_message: cfg.voicemail_message.clone(),
        filler_phrases,
        builtin_tools,
        custom_tools,
    }
}

fn convert_transfer_number_rule(rule: &TransferNumberRule) -> tools::TransferRule {
    tools::TransferRule {
        phone_number: rule.phone_number.clone(),
        condition: rule.condition.clone(),
        transfer_type: parse_transfer_type(&rule.transfer_type),
        transfer_message: rule.transfer_message.clone(),
        enable_client_message: rule.enable_client_message,
    }
}

fn convert_transfer_agent_rule(rule: &TransferAgentRule) -> tools::AgentTransferRule {
    tools::AgentTransferRule {
        agent_id: rule.agent_id.clone(),
        condition: rule.condition.clone(),
        delay_seconds: rule.delay_seconds,
        transfer_message: rule.transfer_message.clone(),
        first_message: rule.first_message.clone(),
    }
}

fn parse_transfer_type(value: &str) -> TransferType {
    match value {
        "sip_refer" => TransferType::SipRefer,
        _ => TransferType::Conference,
    }
}

fn convert_custom_tool(cfg: &crate::configservice::CustomToolConfig) -> CustomToolDescriptor {
    CustomToolDescriptor {
        name: cfg.name.clone(),
        description: cfg.description.clone(),
        url_template: cfg.url_template.clone(),
        method: cfg.method.clone(),
        path_params: cfg.path_params.iter().filter_map(parse_param_spec).collect(),
        query_params: cfg.query_params.iter().filter_map(parse_query_param_spec).collect(),
        headers: cfg.headers.clone(),
        response_timeout: Duration::from_millis(cfg.response_timeout_ms),
        extract: cfg.extract.clone(),
        parameters_schema: cfg.parameters_schema.clone(),
    }
}

fn parse_param_spec(value: &serde_json::Value) -> Option<ParamSpec> {
    let name = value.get("name")?.as_str()?.to_string();
    let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("string").to_string();
    Some(ParamSpec { name, kind })
}

fn parse_query_param_spec(value: &serde_json::Value) -> Option<QueryParamSpec> {
    let name = value.get("name")?.as_str()?.to_string();
    let constant = value.get("constant").and_then(|v| v.as_str()).map(str::to_string);
    Some(QueryParamSpec { name, constant })
}

/// Drives a call's inbound events until the telephony socket closes or a
/// timer fires.
async fn drive_call(
    session: &Arc<CallSession>,
    ctx: &Arc<Ctx>,
    inbound_rx: &mut mpsc::UnboundedReceiver<InboundEvent>,
) {
    let max_duration_sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(session.max_duration_deadline));
    tokio::pin!(max_duration_sleep);

    loop {
        let silence_deadline = session.silence_deadline().await;
        let silence_sleep = async {
            match silence_deadline {
                Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            event = inbound_rx.recv() => {
                match event {
                    Some(InboundEvent::Media(payload)) => {
                        if let Err(e) = turn_taking::ingest_media_frame(session, &ctx.gpu, &payload).await {
                            warn!(call_id = %session.call_id, error = %e, "failed to ingest media frame");
                        }
                    }
                    Some(InboundEvent::Mark(name)) => handle_mark(session, &name).await,
                    None => {
                        cleanup(session, ctx, "telephony_stream_closed").await;
                        return;
                    }
                }
            }
            _ = &mut max_duration_sleep => {
                end_call(session, ctx, "max_duration_exceeded").await;
                return;
            }
            _ = silence_sleep => {
                end_call(session, ctx, "silence_timeout").await;
                return;
            }
        }

        if session.status().await != CallStatus::Active {
            return;
        }
    }
}

/// Only `ai_speech_end` marks are ever sent by this system; the
/// provider echoes back whatever name it was given. `ai_is_speaking` only
/// clears once every outstanding mark for the current utterance has echoed,
/// since TTS synthesizes sentence by sentence and several can be in flight.
async fn handle_mark(session: &Arc<CallSession>, name: &str) {
    if name != "ai_speech_end" {
        return;
    }
    if session.pending_ai_speech_marks.load(Ordering::SeqCst) == 0 {
        return;
    }
    let remaining = session.pending_ai_speech_marks.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 {
        session.flags.lock().await.ai_is_speaking = false;
        session.restart_silence_timer().await;
    }
}

async fn handle_llm_event(session: &Arc<CallSession>, ctx: &Arc<Ctx>, event: LlmEvent) {
    match event {
        LlmEvent::TextDelta(delta) => {
            let sentences = session.tts_text_buffer.lock().await.push(&delta);
            for sentence in sentences {
                enqueue_speech(session, sentence).await;
            }
        }
        LlmEvent::TextDone(full_text) => {
            let remainder = session.tts_text_buffer.lock().await.flush();
            if let Some(remainder) = remainder {
                enqueue_speech(session, remainder).await;
            }
            if !full_text.trim().is_empty() {
                record_transcript(session, "assistant", &full_text).await;
            }
        }
        LlmEvent::ResponseCreated(_id) => {
            session.flags.lock().await.response_in_flight = true;
        }
        LlmEvent::ResponseDone(_) => {
            session.flags.lock().await.response_in_flight = false;
        }
        LlmEvent::FunctionCall { call_id, name, args } => {
            handle_function_call(session, ctx, call_id, name, args).await;
        }
        LlmEvent::ItemCreated { id, role: _ } => {
            session.remote_item_ids.lock().await.push(id);
            maybe_summarize(session, ctx).await;
        }
        LlmEvent::Error(message) => {
            warn!(call_id = %session.call_id, error = %message, "LLM session reported an error");
        }
        LlmEvent::Closed => {
            info!(call_id = %session.call_id, "LLM session closed; call proceeds deaf until teardown");
        }
    }
}

async fn enqueue_speech(session: &Arc<CallSession>, text: String) {
    let (language, voice) = session.current_language().await;
    if let Err(e) = session.tts_tx.enqueue(tts_queue::TtsJob::Speak { text, language, voice }) {
        warn!(call_id = %session.call_id, error = %e, "failed to enqueue synthesized speech");
    }
}

async fn record_transcript(session: &Arc<CallSession>, role: &'static str, text: &str) {
    let t_seconds = session.created_at.elapsed().as_secs_f64();
    session
        .transcript
        .lock()
        .await
        .push(crate::session::TranscriptEntry { role, text: text.to_string(), t_seconds });
}

/// Called by `turn_taking` once a completed user turn has been transcribed.
pub async fn send_user_text_to_llm(session: &Arc<CallSession>, text: &str) -> anyhow::Result<()> {
    record_transcript(session, "user", text).await;
    session.llm.send_user_message(text.to_string())?;
    Ok(())
}

/// Cancels any in-flight LLM response, clears the telephony side, and
/// atomically resets the TTS queue so no stale audio plays after the
/// interrupt.
pub async fn interrupt(session: &Arc<CallSession>) {
    let response_in_flight = session.flags.lock().await.response_in_flight;
    if response_in_flight {
        if let Err(e) = session.llm.cancel_response() {
            warn!(call_id = %session.call_id, error = %e, "failed to cancel in-flight LLM response");
        }
    }
    if let Err(e) = tts_queue::send_clear(&session.stream_sid, &session.telephony_tx) {
        warn!(call_id = %session.call_id, error = %e, "failed to send telephony clear event");
    }
    session.tts_tx.reset();
    session.tts_text_buffer.lock().await.flush();
    session.turn.lock().await.pre_roll_ring.clear();
    session.flags.lock().await.ai_is_speaking = false;
    session.pending_ai_speech_marks.store(0, Ordering::SeqCst);
    session.restart_silence_timer().await;
}

async fn handle_function_call(session: &Arc<CallSession>, ctx: &Arc<Ctx>, call_id: String, name: String, args: serde_json::Value) {
    if session.config.filler_phrases_enabled && !session.flags.lock().await.ai_is_speaking {
        let phrase = {
            let mut rng = rand::rng();
            session.config.filler_phrases.choose(&mut rng).cloned()
        };
        if let Some(phrase) = phrase {
            enqueue_speech(session, phrase).await;
        }
    }

    let is_builtin = matches!(
        name.as_str(),
        "end_call" | "transfer_to_number" | "transfer_to_agent" | "switch_language" | "report_voicemail_detected"
    );

    let (result, event) = if is_builtin {
        match tools::dispatch_builtin(&name, &args, &session.config.builtin_tools) {
            Ok(outcome) => outcome,
            Err(e) => (failed_result(&e), None),
        }
    } else if let Some(descriptor) = session.config.custom_tools.iter().find(|d| d.name == name) {
        match tools::dispatch_custom(&ctx.tool_http, descriptor, &args).await {
            Ok(result) => {
                if let Some(extracted) = result.data.get("extracted").and_then(|v| v.as_object()) {
                    let mut vars = session.tool_variables.lock().await;
                    for (key, value) in extracted {
                        vars.insert(key.clone(), value.clone());
                    }
                }
                (result, None)
            }
            Err(e) => (failed_result(&e), None),
        }
    } else {
        (
            tools::ToolResult { success: false, message: Some(format!("unknown tool: {name}")), data: serde_json::Value::Null },
            None,
        )
    };

    let result_json = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
    if let Err(e) = session.llm.send_function_result(call_id, &result_json) {
        warn!(call_id = %session.call_id, error = %e, "failed to send tool result back to LLM");
    }

    if let Some(event) = event {
        act_on_tool_event(session, ctx, event).await;
    }
}

fn failed_result(e: &crate::error::ToolError) -> tools::ToolResult {
    tools::ToolResult { success: false, message: Some(e.to_string()), data: serde_json::Value::Null }
}

async fn act_on_tool_event(session: &Arc<CallSession>, ctx: &Arc<Ctx>, event: ToolEvent) {
    match event {
        ToolEvent::EndCallRequested { reason } => {
            let reason_str = match reason {
                EndCallReason::Completed => "completed",
                EndCallReason::UserRequested => "user_requested",
                EndCallReason::NoResponse => "no_response",
            };
            end_call(session, ctx, reason_str).await;
        }
        ToolEvent::VoicemailDetected => {
            if let Some(message) = session.config.voicemail_message.clone() {
                enqueue_speech(session, message).await;
                wait_for_tts_drain(session).await;
            }
            end_call(session, ctx, "voicemail").await;
        }
        ToolEvent::TransferToNumber { phone_number, transfer_type, transfer_message, enable_client_message } => {
            if enable_client_message {
                if let Some(message) = transfer_message {
                    enqueue_speech(session, message).await;
                    wait_for_tts_drain(session).await;
                }
            }
            let twiml = telephony::transfer_to_number_twiml(&phone_number, transfer_type);
            if let Err(e) = ctx.telephony_rest.update_twiml(&session.call_id, &twiml).await {
                warn!(call_id = %session.call_id, error = %e, "failed to issue transfer-to-number call update");
            }
            cleanup(session, ctx, "transferred").await;
        }
        ToolEvent::TransferToAgent { agent_id, delay_seconds, transfer_message, first_message: _ } => {
            if let Some(message) = transfer_message {
                enqueue_speech(session, message).await;
                wait_for_tts_drain(session).await;
            }
            if delay_seconds > 0 {
                tokio::time::sleep(Duration::from_secs(delay_seconds as u64)).await;
            }
            match ctx.configservice.transfer_agent_webhook(&session.call_id, &agent_id).await {
                Ok(url) => {
                    if let Err(e) = ctx.telephony_rest.update_url(&session.call_id, &url).await {
                        warn!(call_id = %session.call_id, error = %e, "failed to issue transfer-to-agent call update");
                    }
                }
                Err(e) => warn!(call_id = %session.call_id, error = %e, "failed to resolve transfer-to-agent webhook"),
            }
            cleanup(session, ctx, "transferred").await;
        }
        ToolEvent::LanguageSwitched { language, voice } => {
            session.set_language(language, voice).await;
        }
    }
}

/// Blocks briefly so a spoken message (a transfer/voicemail notice) has a
/// chance to finish playing before the call is torn down. Bounded
/// so a stuck TTS stream can't hang cleanup forever.
async fn wait_for_tts_drain(session: &Arc<CallSession>) {
    let start = tokio::time::Instant::now();
    while session.pending_ai_speech_marks.load(Ordering::SeqCst) > 0 {
        if start.elapsed() > TTS_DRAIN_MAX_WAIT {
            break;
        }
        tokio::time::sleep(TTS_DRAIN_POLL_INTERVAL).await;
    }
}

async fn end_call(session: &Arc<CallSession>, ctx: &Arc<Ctx>, reason: &str) {
    let status = session.status().await;
    if status == CallStatus::Ending || status == CallStatus::Ended {
        return;
    }
    session.set_status(CallStatus::Ending).await;
    if let Err(e) = ctx.telephony_rest.hangup(&session.call_id).await {
        warn!(call_id = %session.call_id, error = %e, "telephony hangup request failed");
    }
    cleanup(session, ctx, reason).await;
}

/// Terminal teardown, reachable from every exit path (hangup, transfer,
/// telephony-socket close, silence/max-duration timers). Guarded by
/// `mark_cleaned_up` so it only ever runs once per call.
async fn cleanup(session: &Arc<CallSession>, ctx: &Arc<Ctx>, reason: &str) {
    if !session.mark_cleaned_up() {
        return;
    }
    session.set_status(CallStatus::Ended).await;
    session.clear_silence_timer().await;
    session.llm.close();

    if let Err(e) = ctx.gpu.vad_reset(&session.internal_session_id).await {
        warn!(call_id = %session.call_id, error = %e, "VAD reset failed during cleanup");
    }

    let transcript: Vec<TranscriptLine> = session
        .transcript
        .lock()
        .await
        .iter()
        .map(|entry| TranscriptLine { role: entry.role, message: entry.text.clone(), time_in_call_secs: entry.t_seconds })
        .collect();
    let dynamic_variables = session.tool_variables.lock().await.clone();
    let duration_seconds = session.created_at.elapsed().as_secs();

    let payload = CallCompletePayload {
        call_sid: session.call_id.clone(),
        assistant_id: session.config.assistant_id.clone(),
        organization_id: session.config.organization_id.clone(),
        status: "done",
        end_reason: reason.to_string(),
        duration_seconds,
        transcript,
        dynamic_variables,
    };
    if let Err(e) = ctx.configservice.complete_call(&payload).await {
        warn!(call_id = %session.call_id, error = %e, "failed to post call completion");
    }

    ctx.registry.unregister(&session.call_id).await;
    info!(call_id = %session.call_id, reason = %reason, "call cleaned up");
}

/// Condenses the tracked transcript into 2-4 sentences once it crosses the
/// word-count threshold, injects the summary as a system message, and
/// deletes the summarized items from the remote conversation. The
/// `summarization_in_flight` flag keeps a slow chat-completions round trip
/// from overlapping with another one started by the next conversation item.
async fn maybe_summarize(session: &Arc<CallSession>, ctx: &Arc<Ctx>) {
    if !session.config.context_summarization_enabled {
        return;
    }

    {
        let mut flags = session.flags.lock().await;
        if flags.summarization_in_flight {
            return;
        }
        let word_count: usize =
            session.transcript.lock().await.iter().map(|e| e.text.split_whitespace().count()).sum();
        if word_count <= WORD_COUNT_SUMMARIZATION_THRESHOLD {
            return;
        }
        flags.summarization_in_flight = true;
    }

    let transcript_text: String = session
        .transcript
        .lock()
        .await
        .iter()
        .map(|e| format!("{}: {}", e.role, e.text))
        .collect::<Vec<_>>()
        .join("\n");
    let item_ids: Vec<String> = session.remote_item_ids.lock().await.clone();

    match summarize_transcript(&ctx.openai, &ctx.tool_http, &transcript_text).await {
        Ok(summary) => {
            if let Err(e) = session.llm.inject_context(format!("Summary of the conversation so far: {summary}")) {
                warn!(call_id = %session.call_id, error = %e, "failed to inject conversation summary");
            }
            for id in &item_ids {
                if let Err(e) = session.llm.delete_item(id.clone()) {
                    warn!(call_id = %session.call_id, error = %e, "failed to delete summarized conversation item");
                }
            }
            session.transcript.lock().await.clear();
            session.remote_item_ids.lock().await.clear();
        }
        Err(e) => {
            warn!(call_id = %session.call_id, error = %e, "context summarization failed, leaving transcript intact");
        }
    }

    session.flags.lock().await.summarization_in_flight = false;
}

async fn summarize_transcript(openai: &OpenAiConfig, http: &reqwest::Client, transcript: &str) -> anyhow::Result<String> {
    let body = serde_json::json!({
        "model": openai.model,
        "messages": [
            {
                "role": "system",
                "content": "Summarize the following customer service call transcript in 2-4 sentences, preserving any facts the assistant will need to continue the conversation.",
            },
            {"role": "user", "content": transcript},
        ],
        "temperature": 0.2,
    });

    let resp = http.post(openai.chat_completions_url()).bearer_auth(&openai.api_key).json(&body).send().await?;
    let value: serde_json::Value = resp.json().await?;
    value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("malformed chat completion response"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_pending() -> PendingCall {
        PendingCall {
            assistant_id: "asst_1".to_string(),
            organization_id: "org_1".to_string(),
            twilio_auth_token: Some("tok".to_string()),
            caller_number: "+15551234567".to_string(),
        }
    }

    fn base_assistant_config() -> AssistantConfig {
        serde_json::from_value(serde_json::json!({
            "system_prompt": "You are helpful.",
            "first_message": "Hello!",
            "voicemail_message": "Please call back.",
            "language": "en",
            "voice": null,
            "silence_timeout_seconds": 30,
            "max_duration_seconds": 1800,
            "twilio_account_sid": "ACxxx",
            "twilio_auth_token": "tokxxx",
        }))
        .unwrap()
    }

    #[test]
    fn build_call_config_defaults_filler_phrases_when_unconfigured() {
        let config = build_call_config(&base_pending(), &base_assistant_config());
        let expected: Vec<String> = DEFAULT_FILLER_PHRASES.iter().map(|s| s.to_string()).collect();
        assert_eq!(config.filler_phrases, expected);
    }

    #[test]
    fn build_call_config_skips_custom_tools_when_not_allowed() {
        let mut cfg = base_assistant_config();
        cfg.custom_tools_allowed = false;
        cfg.custom_tools = vec![serde_json::from_value(serde_json::json!({
            "name": "lookup",
            "description": "looks something up",
            "url_template": "https://example.test/{id}",
            "method": "GET",
        }))
        .unwrap()];
        let config = build_call_config(&base_pending(), &cfg);
        assert!(config.custom_tools.is_empty());
    }

    #[test]
    fn build_call_config_carries_voicemail_flag_into_builtin_tools() {
        let mut cfg = base_assistant_config();
        cfg.voicemail_detection = true;
        let config = build_call_config(&base_pending(), &cfg);
        assert!(config.builtin_tools.voicemail_detection_enabled);
    }

    #[test]
    fn parse_transfer_type_falls_back_to_conference_for_unknown_values() {
        assert_eq!(parse_transfer_type("sip_refer"), TransferType::SipRefer);
        assert_eq!(parse_transfer_type("bridge"), TransferType::Conference);
    }
}
