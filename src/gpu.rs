//! GPU inference service client.
//!
//! One pooled `reqwest::Client` wrapped with one method per endpoint so each
//! call site can pick its own timeout rather than inherit a client-wide
//! default — a shared global timeout is unsafe here because VAD is on the
//! hot audio path and must fail fast while STT is allowed to take much
//! longer. The client is process-global and stateless; every call
//! carries the `X-API-Key` shared-secret header.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::error::GpuClientError;

const VAD_DETECT_TIMEOUT: Duration = Duration::from_secs(2);
const TURN_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const STT_TIMEOUT: Duration = Duration::from_secs(20);
pub const TTS_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const TTS_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const VAD_RESET_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VadEvent {
    SpeechStart,
    Silence,
    SpeechEnd,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VadResult {
    pub event: VadEvent,
    pub probability: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnCheckResult {
    pub complete: bool,
    #[allow(dead_code)]
    pub confidence: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SttResult {
    pub text: String,
    #[allow(dead_code)]
    pub language: Option<String>,
    #[allow(dead_code)]
    pub confidence: Option<f32>,
    #[allow(dead_code)]
    pub processing_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResult {
    pub status: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub model_loaded: bool,
}

pub struct GpuClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GpuClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(TTS_CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client builds with static configuration");
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &'static str,
        path: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, GpuClientError> {
        let resp = self
            .http
            .post(self.url(path))
            .header("X-API-Key", &self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GpuClientError::Timeout { endpoint, timeout_ms: timeout.as_millis() as u64 }
                } else {
                    GpuClientError::Request { endpoint, source: e }
                }
            })?;

        resp.json::<T>().await.map_err(|e| GpuClientError::MalformedResponse {
            endpoint,
            message: e.to_string(),
        })
    }

    /// `POST /vad/detect`. Session-stateful on the server side. On failure,
    /// callers log and drop the batch, releasing the in-flight guard.
    pub async fn vad_detect(
        &self,
        wav_base64: &str,
        sample_rate: u32,
        session_id: &str,
    ) -> Result<VadResult, GpuClientError> {
        self.post_json(
            "vad_detect",
            "/vad/detect",
            json!({ "audio": wav_base64, "sample_rate": sample_rate, "session_id": session_id }),
            VAD_DETECT_TIMEOUT,
        )
        .await
    }

    /// `POST /turn/check`. On timeout or transport failure, callers treat the
    /// turn as complete rather than stall the caller.
    pub async fn turn_check(&self, wav_base64: &str) -> Result<TurnCheckResult, GpuClientError> {
        self.post_json(
            "turn_check",
            "/turn/check",
            json!({ "audio": wav_base64 }),
            TURN_CHECK_TIMEOUT,
        )
        .await
    }

    /// `POST /stt/transcribe`. `/process/audio` (combined VAD+STT) is never
    /// called — VAD has already confirmed speech by the time this runs, so
    /// re-running it would be wasted GPU time.
    pub async fn stt_transcribe(
        &self,
        wav_base64: &str,
        language: &str,
    ) -> Result<SttResult, GpuClientError> {
        self.post_json(
            "stt_transcribe",
            "/stt/transcribe",
            json!({ "audio": wav_base64, "language": language, "sample_rate": 16000 }),
            STT_TIMEOUT,
        )
        .await
    }

    /// `POST /tts/synthesize`, streaming. Returns the raw byte stream; the
    /// caller (the pipeline's TTS queue) owns the 10s per-chunk idle timeout
    /// because only it knows when a `data` event resets the clock.
    pub async fn tts_synthesize_stream(
        &self,
        text: &str,
        language: &str,
        voice: Option<&str>,
    ) -> Result<impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>>, GpuClientError>
    {
        let mut body = json!({ "text": text, "language": language, "streaming": true });
        if let Some(voice) = voice {
            body["voice"] = json!(voice);
        }

        let resp = self
            .http
            .post(self.url("/tts/synthesize"))
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    GpuClientError::Timeout {
                        endpoint: "tts_synthesize",
                        timeout_ms: TTS_CONNECT_TIMEOUT.as_millis() as u64,
                    }
                } else {
                    GpuClientError::Request { endpoint: "tts_synthesize", source: e }
                }
            })?;

        Ok(resp.bytes_stream())
    }

    /// `POST /vad/reset?session_id=...`. Never fatal; log and continue.
    pub async fn vad_reset(&self, session_id: &str) -> Result<(), GpuClientError> {
        self.http
            .post(self.url(&format!("/vad/reset?session_id={session_id}")))
            .header("X-API-Key", &self.api_key)
            .timeout(VAD_RESET_TIMEOUT)
            .send()
            .await
            .map_err(|e| GpuClientError::Request { endpoint: "vad_reset", source: e })?;
        Ok(())
    }

    /// `GET /health`. Used only for the operator health endpoint.
    pub async fn health(&self) -> Result<HealthResult, GpuClientError> {
        let resp = self
            .http
            .get(self.url("/health"))
            .header("X-API-Key", &self.api_key)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| GpuClientError::Request { endpoint: "health", source: e })?;

        resp.json::<HealthResult>()
            .await
            .map_err(|e| GpuClientError::MalformedResponse { endpoint: "health", message: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vad_event_deserializes_from_snake_case() {
        let v: VadResult = serde_json::from_str(r#"{"event":"speech_start","probability":0.91}"#).unwrap();
        assert_eq!(v.event, VadEvent::SpeechStart);
        assert!((v.probability - 0.91).abs() < 1e-6);
    }

    #[test]
    fn url_joins_base_and_path_without_double_slash() {
        let client = GpuClient::new("http://gpu.internal/", "key");
        assert_eq!(client.url("/health"), "http://gpu.internal/health");
    }
}
