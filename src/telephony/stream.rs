//! Audio WebSocket upgrade and per-call read/write loop.
//!
//! Grounded on `examples/other_examples/...twilio-media.rs.rs`'s event enum
//! and its `tokio::select!`-free split-socket pattern (here the read loop and
//! the write loop run as two tasks instead of one `select!`, because the
//! write side already has its own owner — the TTS queue and this module both
//! feed the same outbound channel). `media`/`mark` events are forwarded into
//! an unbounded channel the instant they're parsed, before the pipeline task
//! for this call has necessarily finished connecting to the LLM — ordinary
//! mpsc FIFO order is what satisfies the "queued and drained in order" rule
//! in, with no separate queue structure required.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::pipeline;
use crate::server::AppState;

/// What the read loop hands to the pipeline task for this call. `media`
/// carries the base64 mu-law payload; `mark` carries the echoed mark name
/// (only `ai_speech_end` is ever sent by us, but the provider echoes back
/// whatever name it was given).
pub enum InboundEvent {
    Media(String),
    Mark(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum StreamEvent {
    Connected,
    Start { start: StartMeta },
    Media { media: MediaPayload },
    Mark { mark: MarkPayload },
    Stop,
}

#[derive(Debug, Deserialize)]
struct StartMeta {
    #[serde(rename = "streamSid")]
    stream_sid: String,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct MarkPayload {
    name: String,
}

pub async fn handle_media_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(call_sid): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_stream(socket, state, call_sid))
}

async fn handle_media_stream(socket: WebSocket, state: AppState, call_sid: String) {
    let pending = state.pending_calls.lock().await.remove(&call_sid);
    let caller_number = pending.as_ref().map(|p| p.caller_number.clone()).unwrap_or_default();

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (telephony_tx, mut telephony_rx) = mpsc::unbounded_channel::<Message>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundEvent>();
    let (stream_sid_tx, stream_sid_rx) = oneshot::channel::<String>();

    let writer_call_sid = call_sid.clone();
    tokio::spawn(async move {
        while let Some(msg) = telephony_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                debug!(call_sid = %writer_call_sid, "telephony socket closed while writing");
                break;
            }
        }
    });

    tokio::spawn(pipeline::run_call(
        state,
        call_sid.clone(),
        caller_number,
        pending,
        stream_sid_rx,
        inbound_rx,
        telephony_tx,
    ));

    let mut stream_sid_tx = Some(stream_sid_tx);
    loop {
        let msg = match ws_rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!(call_sid = %call_sid, error = %e, "telephony socket read error");
                break;
            }
            None => break,
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        let event: StreamEvent = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                debug!(call_sid = %call_sid, error = %e, "dropping malformed stream event");
                continue;
            }
        };

        match event {
            StreamEvent::Connected => {}
            StreamEvent::Start { start } => {
                // The stream identifier is set unconditionally, even
                // while the rest of the pipeline (LLM connect, config fetch)
                // is still in flight.
                if let Some(tx) = stream_sid_tx.take() {
                    let _ = tx.send(start.stream_sid);
                }
            }
            StreamEvent::Media { media } => {
                let _ = inbound_tx.send(InboundEvent::Media(media.payload));
            }
            StreamEvent::Mark { mark } => {
                let _ = inbound_tx.send(InboundEvent::Mark(mark.name));
            }
            StreamEvent::Stop => break,
        }
    }

    info!(call_sid = %call_sid, "telephony audio stream ended");
}
