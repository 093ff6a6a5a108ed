//! Process configuration, loaded once at startup from the environment.
//!
//! Each sub-struct has a `Default` impl for its optional knobs, mirroring the
//! teacher's `config.rs` sub-struct shape — but the loader reads environment
//! variables instead of a TOML file plus keyring, since this process is a
//! stateless server rather than a desktop CLI tool.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::error::ConfigError;

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name))
}

fn env_var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub base_url: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-realtime-preview".to_string(),
            temperature: 0.8,
            max_tokens: 1024,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

impl OpenAiConfig {
    /// The realtime WebSocket endpoint for the configured model.
    pub fn realtime_ws_url(&self) -> String {
        let base = self.base_url.replacen("https://", "wss://", 1).replacen("http://", "ws://", 1);
        format!("{base}/realtime?model={}", self.model)
    }

    /// The plain REST chat-completions endpoint used for out-of-band context
    /// summarization — a separate call from the realtime session.
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub server_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct ConfigServiceConfig {
    pub api_url: String,
    pub api_secret: String,
}

/// Process-level defaults for per-call timers; the configuration service's
/// per-assistant values take precedence when
/// present. `silence_end_call_timeout` from the README is treated as an
/// alias of `silence_timeout_seconds`, never modeled separately.
#[derive(Debug, Clone)]
pub struct CallDefaults {
    pub max_call_duration_seconds: u64,
    pub silence_timeout_seconds: u64,
    pub silence_hangup_seconds: u64,
}

impl Default for CallDefaults {
    fn default() -> Self {
        Self {
            max_call_duration_seconds: 1800,
            silence_timeout_seconds: 30,
            silence_hangup_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TwilioConfig {
    pub validate_signatures: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_level: String,
    pub openai: OpenAiConfig,
    pub gpu: GpuConfig,
    pub configservice: ConfigServiceConfig,
    pub call: CallDefaults,
    pub twilio: TwilioConfig,
}

impl Config {
    /// Load configuration from the process environment. Required variables
    /// missing at startup are a fatal, logged error; optional ones
    /// fall back to the documented defaults.
    pub fn from_env() -> Result<Self> {
        let openai = OpenAiConfig {
            api_key: env_var("OPENAI_API_KEY").context("loading OpenAI configuration")?,
            model: env_var_opt("OPENAI_MODEL").unwrap_or_else(|| OpenAiConfig::default().model),
            temperature: env_parse_or("OPENAI_TEMPERATURE", OpenAiConfig::default().temperature),
            max_tokens: env_parse_or("OPENAI_MAX_TOKENS", OpenAiConfig::default().max_tokens),
            base_url: env_var_opt("OPENAI_BASE_URL").unwrap_or_else(|| OpenAiConfig::default().base_url),
        };

        let gpu = GpuConfig {
            server_url: env_var("GPU_SERVER_URL").context("loading GPU server configuration")?,
            api_key: env_var("GPU_SERVER_API_KEY").context("loading GPU server configuration")?,
        };

        let configservice = ConfigServiceConfig {
            api_url: env_var("LARAVEL_API_URL").context("loading configuration service")?,
            api_secret: env_var("LARAVEL_API_SECRET").context("loading configuration service")?,
        };

        let defaults = CallDefaults::default();
        let call = CallDefaults {
            max_call_duration_seconds: env_parse_or(
                "MAX_CALL_DURATION_SECONDS",
                defaults.max_call_duration_seconds,
            ),
            silence_timeout_seconds: env_parse_or(
                "SILENCE_TIMEOUT_SECONDS",
                defaults.silence_timeout_seconds,
            ),
            silence_hangup_seconds: env_parse_or(
                "SILENCE_HANGUP_SECONDS",
                defaults.silence_hangup_seconds,
            ),
        };

        let twilio = TwilioConfig {
            validate_signatures: env_parse_or("TWILIO_VALIDATE_SIGNATURES", true),
        };

        Ok(Self {
            port: env_parse_or("PORT", 3000),
            log_level: env_var_opt("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            openai,
            gpu,
            configservice,
            call,
            twilio,
        })
    }

    pub fn max_call_duration(&self) -> Duration {
        Duration::from_secs(self.call.max_call_duration_seconds)
    }

    pub fn silence_hangup(&self) -> Duration {
        Duration::from_secs(self.call.silence_hangup_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "OPENAI_API_KEY", "OPENAI_MODEL", "OPENAI_TEMPERATURE", "OPENAI_MAX_TOKENS",
            "GPU_SERVER_URL", "GPU_SERVER_API_KEY", "LARAVEL_API_URL", "LARAVEL_API_SECRET",
            "MAX_CALL_DURATION_SECONDS", "SILENCE_TIMEOUT_SECONDS", "SILENCE_HANGUP_SECONDS",
            "TWILIO_VALIDATE_SIGNATURES", "LOG_LEVEL", "PORT",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn missing_required_var_is_a_fatal_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let result = Config::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn defaults_apply_when_optional_vars_are_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("OPENAI_API_KEY", "sk-test");
        std::env::set_var("GPU_SERVER_URL", "http://gpu.internal");
        std::env::set_var("GPU_SERVER_API_KEY", "gpu-secret");
        std::env::set_var("LARAVEL_API_URL", "http://config.internal");
        std::env::set_var("LARAVEL_API_SECRET", "cfg-secret");

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.openai.temperature, 0.8);
        assert_eq!(config.call.silence_timeout_seconds, 30);
        assert!(config.twilio.validate_signatures);
        clear_all();
    }
}
