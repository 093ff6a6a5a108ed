//! Call session and the process-wide call registry.
//!
//! The registry's shape is grounded on `server/device.rs`'s `DeviceRegistry`:
//! an `Arc<Self>` wrapping an async `RwLock<HashMap<...>>`, with
//! register/unregister/list methods and no locking required on per-entry
//! state because each entry is only ever driven by its own call's task.
//! `CallSession` itself is new — its shape comes straight from the call's
//! data model, not from any single teacher struct — but it follows the same
//! rule the teacher's session-like types follow: every field is populated at
//! construction, nothing is `Option` just to defer initialization.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::llm::LlmSession;
use crate::pipeline::sentence::SentenceBuffer;
use crate::pipeline::tts_queue::TtsQueue;
use crate::tools::{BuiltinToolConfig, CustomToolDescriptor};

/// Per-account telephony REST credentials, cached on the
/// session once at construction and never recreated — the provider's REST
/// client for transfer/hangup calls is built from these.
#[derive(Debug, Clone)]
pub struct TelephonyCredentials {
    pub account_sid: String,
    pub auth_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Connecting,
    Active,
    Ending,
    Ended,
}

#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub role: &'static str,
    pub text: String,
    pub t_seconds: f64,
}

/// Configuration snapshot fetched from the configuration service at call
/// start; immutable for the life of the call
/// except for `language`/`voice`, which `switch_language` updates in place.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub assistant_id: String,
    pub organization_id: String,
    pub system_prompt: String,
    pub language: String,
    pub voice: Option<String>,
    pub language_voice_map: HashMap<String, Option<String>>,
    pub silence_hangup_seconds: u64,
    pub max_call_duration_seconds: u64,
    pub end_call_allowed: bool,
    pub transfer_to_number_allowed: bool,
    pub transfer_to_agent_allowed: bool,
    pub custom_tools_allowed: bool,
    pub language_detection: bool,
    pub voicemail_detection: bool,
    pub filler_phrases_enabled: bool,
    pub context_summarization_enabled: bool,
    pub first_message: String,
    pub voicemail_message: Option<String>,
    pub filler_phrases: Vec<String>,
    pub builtin_tools: BuiltinToolConfig,
    pub custom_tools: Vec<CustomToolDescriptor>,
}

/// Independent boolean flags tracked per call. Plain `bool`
/// fields behind a `Mutex<Flags>` rather than individual atomics — several
/// flags are read-then-written together by the pipeline's event handlers
/// (e.g. checking `ai_is_speaking` while setting `speech_started_while_ai_was_speaking`)
/// and splitting them across independent atomics would reintroduce the races
/// a single lock avoids.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    pub user_is_speaking: bool,
    pub ai_is_speaking: bool,
    pub speech_started_while_ai_was_speaking: bool,
    pub awaiting_turn_confirmation: bool,
    pub vad_request_in_flight: bool,
    pub stt_request_in_flight: bool,
    pub summarization_in_flight: bool,
    /// True between `response.created` and `response.done`/cancel — lets
    /// `interrupt` know whether a `cancelResponse` is actually
    /// warranted instead of firing one against no in-flight response.
    pub response_in_flight: bool,
}

/// Audio buffers, accumulators, and counters for the turn-taking state
/// machine. Guarded by one lock for the
/// same reason as `Flags`: VAD batch formation reads and mutates the
/// accumulator and pre-roll ring together.
#[derive(Debug, Default)]
pub struct TurnState {
    pub speech_buffer: Vec<u8>,
    pub vad_accumulator: Vec<u8>,
    pub pre_roll_ring: VecDeque<Vec<u8>>,
    pub turn_silence_ms: u64,
    pub turn_start: Option<Instant>,
}

impl TurnState {
    /// The pre-roll ring never exceeds 2 entries; eviction is FIFO.
    pub fn push_pre_roll(&mut self, batch: Vec<u8>) {
        self.pre_roll_ring.push_back(batch);
        while self.pre_roll_ring.len() > 2 {
            self.pre_roll_ring.pop_front();
        }
    }
}

pub struct CallSession {
    pub call_id: String,
    pub caller_number: String,
    pub internal_session_id: String,
    pub status: Mutex<CallStatus>,
    pub created_at: Instant,

    pub config: CallConfig,
    pub telephony_credentials: TelephonyCredentials,

    pub flags: Mutex<Flags>,
    pub turn: Mutex<TurnState>,

    /// Consecutive confirmed `speech_start` events, for the interrupt
    /// threshold.
    pub consecutive_speech_starts: AtomicU32,
    /// Fast-interrupt bypass counter, reset whenever AI speech stops.
    pub fast_interrupt_count: AtomicU32,

    pub transcript: Mutex<Vec<TranscriptEntry>>,
    pub remote_item_ids: Mutex<Vec<String>>,
    pub tool_variables: Mutex<HashMap<String, serde_json::Value>>,

    pub telephony_tx: mpsc::UnboundedSender<axum::extract::ws::Message>,
    pub llm: LlmSession,
    pub stream_sid: String,

    /// Serial TTS playback queue: a dedicated task drains jobs one sentence
    /// at a time and owns the atomic reset-on-interrupt behavior; the session only holds the enqueue handle.
    pub tts_tx: TtsQueue,

    /// Count of `ai_speech_end` marks sent to the telephony socket that have
    /// not yet echoed back. Because the TTS queue synthesizes sentence by
    /// sentence, several marks can be in flight at once; `ai_is_speaking`
    /// only clears once this reaches zero.
    pub pending_ai_speech_marks: AtomicU32,

    /// Set once, at most, when `end_call`/transfer cleanup has run —
    /// guards the idempotence invariant.
    cleaned_up: AtomicBool,

    /// Elapsed milliseconds since call start at which the last activity was
    /// observed, used by the silence-hangup timer logic in the pipeline.
    pub last_activity_ms: AtomicU64,

    /// `None` means the silence hangup timer is currently cleared (e.g.
    /// while the AI is speaking or a turn is in progress). Set/cleared by
    /// the pipeline.
    silence_deadline: Mutex<Option<Instant>>,

    /// Fixed at construction from `config.max_call_duration_seconds`; the
    /// max-duration timer never resets mid-call.
    pub max_duration_deadline: Instant,

    /// The only part of `config` that mutates mid-call: `switch_language`
    /// updates this in place, independent of the immutable `CallConfig`
    /// snapshot.
    active_language: Mutex<(String, Option<String>)>,

    /// Sentence-boundary accumulator for in-flight LLM output. Lives on the
    /// session rather than as task-local state in the LLM event loop so
    /// `interrupt`, running from the turn-taking task, can clear it.
    pub tts_text_buffer: Mutex<SentenceBuffer>,
}

impl CallSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: String,
        caller_number: String,
        internal_session_id: String,
        config: CallConfig,
        telephony_credentials: TelephonyCredentials,
        telephony_tx: mpsc::UnboundedSender<axum::extract::ws::Message>,
        llm: LlmSession,
        stream_sid: String,
        tts_tx: TtsQueue,
    ) -> Arc<Self> {
        let now = Instant::now();
        let max_duration_deadline = now + Duration::from_secs(config.max_call_duration_seconds);
        let active_language = Mutex::new((config.language.clone(), config.voice.clone()));
        Arc::new(Self {
            call_id,
            caller_number,
            internal_session_id,
            status: Mutex::new(CallStatus::Connecting),
            created_at: now,
            telephony_credentials,
            flags: Mutex::new(Flags::default()),
            turn: Mutex::new(TurnState::default()),
            consecutive_speech_starts: AtomicU32::new(0),
            fast_interrupt_count: AtomicU32::new(0),
            transcript: Mutex::new(Vec::new()),
            remote_item_ids: Mutex::new(Vec::new()),
            tool_variables: Mutex::new(HashMap::new()),
            telephony_tx,
            llm,
            stream_sid,
            tts_tx,
            pending_ai_speech_marks: AtomicU32::new(0),
            cleaned_up: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(0),
            silence_deadline: Mutex::new(Some(now + Duration::from_secs(config.silence_hangup_seconds))),
            max_duration_deadline,
            active_language,
            tts_text_buffer: Mutex::new(SentenceBuffer::new()),
            config,
        })
    }

    /// Marks cleanup as having run, returning `true` the first time only.
    /// Every cleanup path (hangup, transfer, error, silence timeout, max
    /// duration) must check this before touching the registry or sockets.
    pub fn mark_cleaned_up(&self) -> bool {
        self.cleaned_up
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub async fn set_status(&self, status: CallStatus) {
        *self.status.lock().await = status;
    }

    pub async fn status(&self) -> CallStatus {
        *self.status.lock().await
    }

    /// (Re)starts the silence hangup timer, e.g. after a turn completes or
    /// the AI finishes speaking.
    pub async fn restart_silence_timer(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.config.silence_hangup_seconds);
        *self.silence_deadline.lock().await = Some(deadline);
    }

    /// Clears the silence hangup timer, e.g. while the AI is speaking or a
    /// turn is actively being held for confirmation.
    pub async fn clear_silence_timer(&self) {
        *self.silence_deadline.lock().await = None;
    }

    pub async fn silence_deadline(&self) -> Option<Instant> {
        *self.silence_deadline.lock().await
    }

    /// Current `(language, voice)` pair, reflecting any prior `switch_language`
    /// tool call.
    pub async fn current_language(&self) -> (String, Option<String>) {
        self.active_language.lock().await.clone()
    }

    /// Applied by the `switch_language` tool handler.
    pub async fn set_language(&self, language: String, voice: Option<String>) {
        *self.active_language.lock().await = (language, voice);
    }
}

/// Process-wide registry mapping call identifier to session. The only
/// globally shared mutable structure in the system; per-session state
/// needs no locking beyond the session's own internal mutexes because each
/// call's pipeline task is the sole driver of its session.
pub struct CallRegistry {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
}

impl CallRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sessions: RwLock::new(HashMap::new()) })
    }

    pub async fn register(&self, session: Arc<CallSession>) {
        self.sessions.write().await.insert(session.call_id.clone(), session);
    }

    pub async fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.read().await.get(call_id).cloned()
    }

    /// Removal happens exactly once per call, driven by `CallSession::mark_cleaned_up`
    /// on the caller's side — calling this twice is harmless (the second
    /// call is simply a no-op `remove` on an absent key).
    pub async fn unregister(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.write().await.remove(call_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_roll_ring_evicts_fifo_past_two_entries() {
        let mut turn = TurnState::default();
        turn.push_pre_roll(vec![1]);
        turn.push_pre_roll(vec![2]);
        turn.push_pre_roll(vec![3]);
        assert_eq!(turn.pre_roll_ring.len(), 2);
        assert_eq!(turn.pre_roll_ring[0], vec![2]);
        assert_eq!(turn.pre_roll_ring[1], vec![3]);
    }

    #[test]
    fn cleanup_flag_only_flips_once() {
        let cleaned = AtomicBool::new(false);
        let first = cleaned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        let second = cleaned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn registry_unregister_is_idempotent() {
        let registry = CallRegistry::new();
        assert!(registry.get("missing").await.is_none());
        assert!(registry.unregister("missing").await.is_none());
        assert!(registry.unregister("missing").await.is_none());
        assert_eq!(registry.len().await, 0);
    }
}
