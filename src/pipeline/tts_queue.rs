//! Serial per-call TTS playback queue.
//!
//! One task per call drains jobs strictly in enqueue order — the total-order
//! gate for all outbound audio. Interrupt resets the queue
//! atomically: a `generation` counter is bumped, and every job (including
//! ones already pulled off the channel) checks its captured generation
//! against the live one before it does any synthesis or sends any frame, so
//! sentences produced before the interrupt never play after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message as WsMessage;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::audio::pcm16_to_mulaw;
use crate::gpu::{GpuClient, TTS_IDLE_TIMEOUT};
use crate::session::CallSession;

pub enum TtsJob {
    /// An LLM-produced sentence, or a filler phrase chosen by the pipeline.
    Speak { text: String, language: String, voice: Option<String> },
}

struct Shared {
    call_id: String,
    generation: AtomicU64,
    stream_sid: String,
}

/// Handle kept on the session; cheap to clone, used to enqueue jobs and to
/// trigger an atomic reset on interrupt.
#[derive(Clone)]
struct TtsQueueHandle {
    shared: Arc<Shared>,
}

impl TtsQueueHandle {
    /// Bumps the generation counter so every job enqueued before this call
    /// (including ones mid-synthesis) becomes stale and is skipped.
    fn reset(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Current generation, captured by the caller at enqueue time so a later
    /// reset doesn't retroactively invalidate a job legitimately queued
    /// before it.
    fn current_generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }
}

/// What the session actually holds: the raw `(job, generation)` sender is
/// easy to misuse directly (every enqueue must capture "now", not some stale
/// generation read earlier), so this pairs the sender with the handle and
/// captures the generation itself on every `enqueue`.
#[derive(Clone)]
pub struct TtsQueue {
    tx: mpsc::UnboundedSender<(TtsJob, u64)>,
    handle: TtsQueueHandle,
}

impl TtsQueue {
    pub fn enqueue(&self, job: TtsJob) -> anyhow::Result<()> {
        let generation = self.handle.current_generation();
        self.tx
            .send((job, generation))
            .map_err(|_| anyhow::anyhow!("TTS queue task is gone"))
    }

    /// Atomically resets the queue on interrupt: every job enqueued
    /// before this call, including one mid-synthesis, is skipped.
    pub fn reset(&self) {
        self.handle.reset();
    }
}

/// Spawns the drain task and returns a `TtsQueue` handle for the session,
/// plus a one-shot sender the caller must use to hand back the `CallSession`
/// once it exists. `CallSession::new` itself takes a `TtsQueue`, so the
/// session can't be built before this call — the task parks on the one-shot
/// receiver first and only starts draining jobs once attached. No job is
/// ever enqueued before the session exists, so this never blocks in practice.
/// `telephony_tx` is the same channel the telephony stream's writer task
/// reads from, so TTS frames interleave correctly with any other outbound
/// control frames (marks, clears) for this call.
pub fn spawn(
    call_id: String,
    stream_sid: String,
    gpu: Arc<GpuClient>,
    telephony_tx: mpsc::UnboundedSender<WsMessage>,
) -> (TtsQueue, oneshot::Sender<Arc<CallSession>>) {
    let shared = Arc::new(Shared { call_id, generation: AtomicU64::new(0), stream_sid });
    let (tx, mut rx) = mpsc::unbounded_channel::<(TtsJob, u64)>();
    let handle = TtsQueueHandle { shared: shared.clone() };
    let (session_tx, session_rx) = oneshot::channel::<Arc<CallSession>>();

    tokio::spawn(async move {
        let session = match session_rx.await {
            Ok(session) => session,
            Err(_) => return,
        };

        while let Some((job, job_generation)) = rx.recv().await {
            if job_generation != shared.generation.load(Ordering::SeqCst) {
                debug!(call_id = %shared.call_id, "skipping stale TTS job after interrupt");
                continue;
            }
            let TtsJob::Speak { text, language, voice } = job;
            if text.trim().is_empty() {
                continue;
            }

            // synthesis beginning clears the silence timer and sets
            // ai_is_speaking before the first frame goes out.
            session.clear_silence_timer().await;
            session.flags.lock().await.ai_is_speaking = true;

            match synthesize_and_send(&shared, &gpu, &telephony_tx, &text, &language, voice.as_deref(), job_generation)
                .await
            {
                Ok(mark_sent) => {
                    if mark_sent {
                        session.pending_ai_speech_marks.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    warn!(call_id = %shared.call_id, error = %e, "TTS synthesis failed");
                    // No mark will ever echo back for this job, so nothing
                    // else will clear ai_is_speaking if it was the only one
                    // outstanding.
                    if session.pending_ai_speech_marks.load(Ordering::SeqCst) == 0 {
                        session.flags.lock().await.ai_is_speaking = false;
                        session.restart_silence_timer().await;
                    }
                }
            }
        }
    });

    (TtsQueue { tx, handle }, session_tx)
}

#[allow(clippy::too_many_arguments)]
async fn synthesize_and_send(
    shared: &Shared,
    gpu: &GpuClient,
    telephony_tx: &mpsc::UnboundedSender<WsMessage>,
    text: &str,
    language: &str,
    voice: Option<&str>,
    job_generation: u64,
) -> anyhow::Result<bool> {
    let mut stream = gpu.tts_synthesize_stream(text, language, voice).await?;
    let mut framer = Framer::new();

    loop {
        if shared.generation.load(Ordering::SeqCst) != job_generation {
            debug!(call_id = %shared.call_id, "abandoning in-flight synthesis after interrupt");
            // No mark is sent for an abandoned job, so the caller must not
            // count one — the interrupt already reset ai_is_speaking.
            return Ok(false);
        }

        let chunk = tokio::time::timeout(TTS_IDLE_TIMEOUT, stream.next()).await;
        let chunk = match chunk {
            Ok(Some(Ok(bytes))) => bytes,
            Ok(Some(Err(e))) => {
                warn!(call_id = %shared.call_id, error = %e, "TTS stream error, ending early");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(call_id = %shared.call_id, "TTS stream idle timeout, ending early");
                break;
            }
        };

        for frame in framer.push(chunk) {
            send_frame(&shared.stream_sid, telephony_tx, &frame)?;
        }
    }

    if let Some(frame) = framer.finish() {
        send_frame(&shared.stream_sid, telephony_tx, &frame)?;
    }
    send_mark(&shared.stream_sid, telephony_tx, "ai_speech_end")?;

    Ok(true)
}

fn send_frame(stream_sid: &str, tx: &mpsc::UnboundedSender<WsMessage>, mulaw: &[u8]) -> anyhow::Result<()> {
    let payload = BASE64.encode(mulaw);
    let msg = serde_json::json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": {"payload": payload},
    });
    tx.send(WsMessage::Text(msg.to_string().into()))
        .map_err(|_| anyhow::anyhow!("telephony writer task is gone"))
}

fn send_mark(stream_sid: &str, tx: &mpsc::UnboundedSender<WsMessage>, name: &str) -> anyhow::Result<()> {
    let msg = serde_json::json!({
        "event": "mark",
        "streamSid": stream_sid,
        "mark": {"name": name},
    });
    tx.send(WsMessage::Text(msg.to_string().into()))
        .map_err(|_| anyhow::anyhow!("telephony writer task is gone"))
}

pub fn send_clear(stream_sid: &str, tx: &mpsc::UnboundedSender<WsMessage>) -> anyhow::Result<()> {
    let msg = serde_json::json!({ "event": "clear", "streamSid": stream_sid });
    tx.send(WsMessage::Text(msg.to_string().into()))
        .map_err(|_| anyhow::anyhow!("telephony writer task is gone"))
}

/// 160 PCM16 samples (20ms @ 8kHz) * 2 bytes/sample.
const FRAME_PCM_BYTES: usize = 320;

/// Peels complete 320-byte PCM16 frames off the head of a buffered chunk
/// list and mu-law-encodes each into a 160-byte telephony frame. Chunks are
/// pushed into a `VecDeque<Bytes>` and drained from the front rather than
/// concatenated, so framing cost is linear in total stream length, not
/// quadratic.
struct Framer {
    pending: std::collections::VecDeque<Bytes>,
    pending_len: usize,
}

impl Framer {
    fn new() -> Self {
        Self { pending: std::collections::VecDeque::new(), pending_len: 0 }
    }

    fn push(&mut self, chunk: Bytes) -> Vec<Vec<u8>> {
        self.pending_len += chunk.len();
        self.pending.push_back(chunk);

        let mut frames = Vec::new();
        while self.pending_len >= FRAME_PCM_BYTES {
            frames.push(self.take_frame());
        }
        frames
    }

    fn take_frame(&mut self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_PCM_BYTES);
        while frame.len() < FRAME_PCM_BYTES {
            let need = FRAME_PCM_BYTES - frame.len();
            let front = self.pending.front_mut().expect("pending_len tracks queued bytes");
            if front.len() <= need {
                frame.extend_from_slice(front);
                self.pending_len -= front.len();
                self.pending.pop_front();
            } else {
                frame.extend_from_slice(&front[..need]);
                *front = front.slice(need..);
                self.pending_len -= need;
            }
        }
        mulaw_from_pcm_bytes(&frame)
    }

    /// Encodes whatever remains (if at least one PCM16 sample's worth of
    /// bytes) when the stream ends.
    fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending_len < 2 {
            return None;
        }
        let usable = self.pending_len - (self.pending_len % 2);
        let mut remainder = Vec::with_capacity(usable);
        let mut taken = 0;
        while taken < usable {
            let need = usable - taken;
            let front = self.pending.front_mut()?;
            if front.len() <= need {
                remainder.extend_from_slice(front);
                taken += front.len();
                self.pending.pop_front();
            } else {
                remainder.extend_from_slice(&front[..need]);
                *front = front.slice(need..);
                taken += need;
            }
        }
        self.pending_len -= usable;
        Some(mulaw_from_pcm_bytes(&remainder))
    }
}

fn mulaw_from_pcm_bytes(pcm_bytes: &[u8]) -> Vec<u8> {
    let samples: Vec<i16> = pcm_bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    pcm16_to_mulaw(&samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_bytes(samples: &[i16]) -> Bytes {
        let mut out = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        Bytes::from(out)
    }

    #[test]
    fn framer_emits_one_frame_per_320_pcm_bytes() {
        let mut framer = Framer::new();
        let samples: Vec<i16> = (0..160).map(|i| i as i16).collect();
        let frames = framer.push(pcm_bytes(&samples));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 160);
    }

    #[test]
    fn framer_splits_across_chunk_boundaries() {
        let mut framer = Framer::new();
        let first: Vec<i16> = (0..100).map(|i| i as i16).collect();
        let second: Vec<i16> = (100..160).map(|i| i as i16).collect();
        let frames_a = framer.push(pcm_bytes(&first));
        assert!(frames_a.is_empty());
        let frames_b = framer.push(pcm_bytes(&second));
        assert_eq!(frames_b.len(), 1);
    }

    #[test]
    fn framer_finish_emits_leftover_remainder() {
        let mut framer = Framer::new();
        let samples: Vec<i16> = (0..50).map(|i| i as i16).collect();
        framer.push(pcm_bytes(&samples));
        let remainder = framer.finish().unwrap();
        assert_eq!(remainder.len(), 50);
    }
}
