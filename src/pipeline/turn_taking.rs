//! VAD batching and the speech_start/silence/speech_end state machine.
//!
//! Every inbound `media` frame is 20ms of 8kHz mu-law. Frames are upsampled
//! to 16kHz PCM16 and accumulated until there's 200ms (10 frames) worth,
//! which is the unit the GPU VAD endpoint actually scores. The pre-roll ring
//! is snapshotted *before* the current batch is pushed into it,
//! so prepending the snapshot at a new turn's start never double-counts the
//! batch that triggered the turn.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::warn;

use crate::audio;
use crate::gpu::{GpuClient, VadEvent, VadResult};
use crate::session::CallSession;

use super::send_user_text_to_llm;

/// 16kHz PCM16 bytes per 200ms batch: 16000 * 0.2 * 2 bytes/sample.
const BATCH_BYTES: usize = 6400;
const BATCH_MS: u64 = 200;
const MIN_SPEECH_DURATION: Duration = Duration::from_millis(200);
const MAX_SPEECH_DURATION: Duration = Duration::from_secs(20);
const SMART_TURN_FALLBACK_SILENCE_MS: u64 = 3000;
const INTERRUPT_THRESHOLD: u32 = 1;
const FAST_INTERRUPT_PROBABILITY: f32 = 0.6;

fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect()
}

/// Entry point called once per inbound `media` event. Decodes/upsamples the
/// frame, accumulates it, and — once a full 200ms batch is available — hands
/// it to the VAD pipeline. Never blocks on the GPU call itself.
pub async fn ingest_media_frame(session: &Arc<CallSession>, gpu: &Arc<GpuClient>, mulaw_b64: &str) -> anyhow::Result<()> {
    let mulaw = BASE64.decode(mulaw_b64.trim())?;
    let samples = audio::mulaw_to_pcm16_16k(&mulaw);
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in &samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }

    let batch = {
        let mut turn = session.turn.lock().await;
        turn.vad_accumulator.extend_from_slice(&bytes);
        if turn.vad_accumulator.len() >= BATCH_BYTES {
            Some(turn.vad_accumulator.drain(..BATCH_BYTES).collect::<Vec<u8>>())
        } else {
            None
        }
    };

    let Some(batch) = batch else { return Ok(()) };
    process_batch(session, gpu, batch).await
}

async fn process_batch(session: &Arc<CallSession>, gpu: &Arc<GpuClient>, batch: Vec<u8>) -> anyhow::Result<()> {
    let pre_roll_snapshot: Vec<u8> = {
        let turn = session.turn.lock().await;
        turn.pre_roll_ring.iter().flatten().cloned().collect()
    };
    {
        let mut turn = session.turn.lock().await;
        turn.push_pre_roll(batch.clone());
    }

    let (user_speaking, awaiting) = {
        let flags = session.flags.lock().await;
        (flags.user_is_speaking, flags.awaiting_turn_confirmation)
    };

    let is_silent = audio::is_silence(&bytes_to_i16(&batch));
    if is_silent && !user_speaking && !awaiting {
        return Ok(());
    }

    let already_in_flight = {
        let mut flags = session.flags.lock().await;
        if flags.vad_request_in_flight {
            true
        } else {
            flags.vad_request_in_flight = true;
            false
        }
    };

    if already_in_flight {
        // One VAD request outstanding per session at a time: fold
        // this batch into the speech buffer if a turn is already open so its
        // audio isn't lost, but don't issue a second request.
        if user_speaking {
            session.turn.lock().await.speech_buffer.extend_from_slice(&batch);
        }
        return Ok(());
    }

    let session = session.clone();
    let gpu = gpu.clone();
    tokio::spawn(async move {
        let wav = audio::pcm16_to_wav_base64(&bytes_to_i16(&batch), 16000);
        let result = gpu.vad_detect(&wav, 16000, &session.internal_session_id).await;
        session.flags.lock().await.vad_request_in_flight = false;

        match result {
            Ok(vad_result) => {
                if let Err(e) = handle_vad_result(&session, &gpu, vad_result, batch, pre_roll_snapshot).await {
                    warn!(call_id = %session.call_id, error = %e, "VAD result handling failed");
                }
            }
            Err(e) => {
                warn!(call_id = %session.call_id, error = %e, "VAD request failed, dropping batch");
            }
        }
    });

    Ok(())
}

async fn handle_vad_result(
    session: &Arc<CallSession>,
    gpu: &Arc<GpuClient>,
    result: VadResult,
    batch: Vec<u8>,
    pre_roll: Vec<u8>,
) -> anyhow::Result<()> {
    let ai_speaking = session.flags.lock().await.ai_is_speaking;
    if ai_speaking && result.probability >= FAST_INTERRUPT_PROBABILITY {
        let count = session.fast_interrupt_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= INTERRUPT_THRESHOLD {
            session.fast_interrupt_count.store(0, Ordering::SeqCst);
            super::interrupt(session).await;
        }
    } else {
        session.fast_interrupt_count.store(0, Ordering::SeqCst);
    }

    match result.event {
        VadEvent::SpeechStart => handle_speech_start(session, gpu, batch, pre_roll).await,
        VadEvent::Silence => handle_silence(session, gpu).await,
        VadEvent::SpeechEnd => handle_speech_end(session, gpu).await,
    }
}

async fn handle_speech_start(
    session: &Arc<CallSession>,
    gpu: &Arc<GpuClient>,
    batch: Vec<u8>,
    pre_roll: Vec<u8>,
) -> anyhow::Result<()> {
    let awaiting = session.flags.lock().await.awaiting_turn_confirmation;

    if awaiting {
        let mut turn = session.turn.lock().await;
        turn.turn_silence_ms = 0;
        turn.speech_buffer.extend_from_slice(&batch);
        drop(turn);
        session.flags.lock().await.user_is_speaking = true;
        session.clear_silence_timer().await;
    } else {
        let already_speaking = session.flags.lock().await.user_is_speaking;
        if !already_speaking {
            let ai_speaking_now = session.flags.lock().await.ai_is_speaking;
            {
                let mut turn = session.turn.lock().await;
                turn.turn_start = Some(Instant::now());
                turn.speech_buffer.extend_from_slice(&pre_roll);
                turn.speech_buffer.extend_from_slice(&batch);
            }
            session.clear_silence_timer().await;
            let mut flags = session.flags.lock().await;
            flags.user_is_speaking = true;
            flags.speech_started_while_ai_was_speaking = ai_speaking_now;
        } else {
            session.turn.lock().await.speech_buffer.extend_from_slice(&batch);
        }
    }

    // Unconditional regardless of which buffer-update branch ran above: a
    // continuation of a held turn still counts as a confirmed speech_start
    // and can still interrupt the AI.
    let confirmed = session.consecutive_speech_starts.fetch_add(1, Ordering::SeqCst) + 1;
    let ai_speaking = session.flags.lock().await.ai_is_speaking;
    if confirmed >= INTERRUPT_THRESHOLD && ai_speaking {
        session.flags.lock().await.speech_started_while_ai_was_speaking = false;
        super::interrupt(session).await;
    }

    if !awaiting {
        let too_long = {
            let turn = session.turn.lock().await;
            turn.turn_start.map(|t| t.elapsed() > MAX_SPEECH_DURATION).unwrap_or(false)
        };
        if too_long {
            force_transcription(session, gpu).await?;
        }
    }

    Ok(())
}

async fn handle_silence(session: &Arc<CallSession>, gpu: &Arc<GpuClient>) -> anyhow::Result<()> {
    let awaiting = session.flags.lock().await.awaiting_turn_confirmation;
    if !awaiting {
        session.consecutive_speech_starts.store(0, Ordering::SeqCst);
        return Ok(());
    }

    let should_force = {
        let mut turn = session.turn.lock().await;
        turn.turn_silence_ms += BATCH_MS;
        turn.turn_silence_ms >= SMART_TURN_FALLBACK_SILENCE_MS
    };

    if should_force {
        // Smart-turn's 3s silence fallback is an accumulator, not a timer:
        // it only ever advances on observed silent batches, so a resumed
        // turn resets it back to zero via `handle_speech_start`'s `awaiting`
        // branch rather than this function racing against a clock.
        session.flags.lock().await.awaiting_turn_confirmation = false;
        force_transcription(session, gpu).await?;
        session.restart_silence_timer().await;
    }

    Ok(())
}

async fn handle_speech_end(session: &Arc<CallSession>, gpu: &Arc<GpuClient>) -> anyhow::Result<()> {
    let is_continuation = session.flags.lock().await.awaiting_turn_confirmation;
    let turn_duration = {
        let turn = session.turn.lock().await;
        turn.turn_start.map(|t| t.elapsed()).unwrap_or(Duration::ZERO)
    };
    let confirmed_count = session.consecutive_speech_starts.swap(0, Ordering::SeqCst);
    let buffer = {
        let mut turn = session.turn.lock().await;
        turn.turn_start = None;
        std::mem::take(&mut turn.speech_buffer)
    };
    session.flags.lock().await.user_is_speaking = false;

    if !is_continuation && turn_duration < MIN_SPEECH_DURATION {
        session.restart_silence_timer().await;
        return Ok(());
    }

    let started_during_ai = session.flags.lock().await.speech_started_while_ai_was_speaking;
    if !is_continuation && started_during_ai && confirmed_count < INTERRUPT_THRESHOLD {
        session.restart_silence_timer().await;
        return Ok(());
    }

    if buffer.is_empty() {
        session.flags.lock().await.awaiting_turn_confirmation = false;
        session.restart_silence_timer().await;
        return Ok(());
    }

    let wav = audio::pcm16_to_wav_base64(&bytes_to_i16(&buffer), 16000);
    let lang = session.current_language().await.0;

    let (turn_result, stt_result) = tokio::join!(gpu.turn_check(&wav), gpu.stt_transcribe(&wav, &lang));

    let complete = match turn_result {
        Ok(r) => r.complete,
        // A failed turn-completeness check shouldn't strand the caller
        // mid-sentence forever; treat it as complete and fall through to STT.
        Err(_) => true,
    };

    if !complete {
        {
            let mut turn = session.turn.lock().await;
            turn.speech_buffer = buffer;
            turn.turn_silence_ms = 0;
        }
        session.flags.lock().await.awaiting_turn_confirmation = true;
        return Ok(());
    }

    session.flags.lock().await.awaiting_turn_confirmation = false;

    match stt_result {
        Ok(stt) if !stt.text.trim().is_empty() => {
            send_user_text_to_llm(session, &stt.text).await?;
        }
        Ok(_) => {}
        Err(_) => {
            // One sequential retry before giving up on this turn's audio.
            if let Ok(stt) = gpu.stt_transcribe(&wav, &lang).await {
                if !stt.text.trim().is_empty() {
                    send_user_text_to_llm(session, &stt.text).await?;
                }
            }
        }
    }

    session.restart_silence_timer().await;
    Ok(())
}

/// Flushes whatever audio has accumulated and forces a transcription+dispatch
/// outside the normal speech_end path — used by both the 20s max-speech
/// guard and the 3s smart-turn silence fallback.
async fn force_transcription(session: &Arc<CallSession>, gpu: &Arc<GpuClient>) -> anyhow::Result<()> {
    let buffer = {
        let mut turn = session.turn.lock().await;
        turn.turn_start = None;
        turn.turn_silence_ms = 0;
        std::mem::take(&mut turn.speech_buffer)
    };
    {
        let mut flags = session.flags.lock().await;
        flags.user_is_speaking = false;
        flags.awaiting_turn_confirmation = false;
    }
    session.consecutive_speech_starts.store(0, Ordering::SeqCst);

    if buffer.is_empty() {
        return Ok(());
    }

    let wav = audio::pcm16_to_wav_base64(&bytes_to_i16(&buffer), 16000);
    let lang = session.current_language().await.0;
    if let Ok(stt) = gpu.stt_transcribe(&wav, &lang).await {
        if !stt.text.trim().is_empty() {
            send_user_text_to_llm(session, &stt.text).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_byte_size_matches_200ms_at_16khz_pcm16() {
        assert_eq!(BATCH_BYTES, 16000 * 2 / 5);
    }

    #[test]
    fn bytes_to_i16_roundtrips_little_endian_samples() {
        let samples: Vec<i16> = vec![1, -1, 32000, -32000];
        let mut bytes = Vec::new();
        for s in &samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        assert_eq!(bytes_to_i16(&bytes), samples);
    }
}
