//! Real-time telephony voice orchestrator.
//!
//! Bridges a telephony provider's audio WebSocket, a GPU-hosted inference
//! service (VAD, turn-completeness, STT, TTS), and a realtime LLM WebSocket
//! session into one call-handling pipeline. See `pipeline::run_call` for the
//! per-call entry point and `server::serve` for process bootstrap.

pub mod audio;
pub mod config;
pub mod configservice;
pub mod error;
pub mod gpu;
pub mod llm;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod telephony;
pub mod tools;

pub use config::Config;
pub use server::serve;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
