//! Process-wide shared state and the axum router.
//!
//! Grounded on `server/mod.rs`'s `ServerState`/`Router` bootstrap: one
//! `Clone`-able state struct threaded through `State<AppState>` extractors,
//! a `TraceLayer` for request logging, and a plain `axum::serve` loop. The
//! pending-call cache is new — the teacher has no equivalent of correlating
//! two separate inbound requests (a webhook, then a WebSocket) by a shared
//! provider-assigned identifier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::configservice::ConfigServiceClient;
use crate::gpu::GpuClient;
use crate::session::CallRegistry;
use crate::telephony::{self, PendingCall};

/// How often the background task refreshes the cached GPU health status
/// `/health` serves. Matches the donor's keepalive-ping cadence order of
/// magnitude — frequent enough to notice an outage, far below a rate that
/// would bother the GPU service.
const GPU_HEALTH_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub configservice: Arc<ConfigServiceClient>,
    pub gpu: Arc<GpuClient>,
    pub registry: Arc<CallRegistry>,
    /// Correlates `POST /voice/incoming` with the audio WebSocket that
    /// follows it, keyed by the provider's call identifier.
    pub pending_calls: Arc<Mutex<HashMap<String, PendingCall>>>,
    /// Plain, unauthenticated client used for custom-tool HTTP calls and for
    /// the context-summarization chat-completions request —
    /// distinct from `GpuClient`/`ConfigServiceClient`, which carry their own
    /// shared-secret headers.
    pub tool_http: reqwest::Client,
    /// Last-known GPU health status, refreshed by a background task so
    /// `/health` never blocks an operator's request on the GPU service's own
    /// timeout.
    gpu_health: Arc<RwLock<String>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let gpu = Arc::new(GpuClient::new(config.gpu.server_url.clone(), config.gpu.api_key.clone()));
        let configservice = Arc::new(ConfigServiceClient::new(
            config.configservice.api_url.clone(),
            config.configservice.api_secret.clone(),
        ));
        let gpu_health = Arc::new(RwLock::new("unknown".to_string()));
        spawn_gpu_health_refresh(gpu.clone(), gpu_health.clone());
        Self {
            config,
            configservice,
            gpu,
            registry: CallRegistry::new(),
            pending_calls: Arc::new(Mutex::new(HashMap::new())),
            tool_http: reqwest::Client::new(),
            gpu_health,
        }
    }
}

/// Polls the GPU service's health endpoint on a fixed interval and updates
/// the shared cache `/health` reads from, so a slow or unreachable GPU
/// service never makes the operator health check itself slow.
fn spawn_gpu_health_refresh(gpu: Arc<GpuClient>, cache: Arc<RwLock<String>>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(GPU_HEALTH_REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            let status = match gpu.health().await {
                Ok(result) => result.status,
                Err(_) => "unreachable".to_string(),
            };
            *cache.write().await = status;
        }
    });
}

async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> axum::Json<serde_json::Value> {
    let active_calls = state.registry.len().await;
    let gpu_status = state.gpu_health.read().await.clone();
    axum::Json(serde_json::json!({
        "status": "ok",
        "active_calls": active_calls,
        "gpu_server": gpu_status,
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/voice/incoming", post(telephony::incoming))
        .route("/voice/status", post(telephony::status))
        .route("/voice/stream/{call_sid}", get(telephony::stream::handle_media_upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the router until the process is killed. Startup
/// failures here — a port already in use — are fatal, matching the
/// missing-environment-variable failure mode in `Config::from_env`.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let port = config.port;
    let state = AppState::new(config);
    let app = router(state);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "voice orchestrator listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            port: 0,
            log_level: "info".to_string(),
            openai: Default::default(),
            gpu: crate::config::GpuConfig { server_url: "http://gpu.test".to_string(), api_key: "k".to_string() },
            configservice: crate::config::ConfigServiceConfig {
                api_url: "http://config.test".to_string(),
                api_secret: "s".to_string(),
            },
            call: Default::default(),
            twilio: Default::default(),
        }
    }

    #[tokio::test]
    async fn router_builds_without_panicking() {
        let state = AppState::new(test_config());
        let _app = router(state);
    }
}
