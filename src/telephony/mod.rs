//! Telephony adapter: incoming-call / status webhooks, TwiML
//! building, request-signature validation, and the provider REST client used
//! by the pipeline for hangup/transfer.
//!
//! The webhook handler shape is grounded on the donor's axum route-handler
//! style (`server/mod.rs`'s `Router`/`State` extractor pattern); signature
//! validation follows `messaging/slack.rs`'s `verify_signature` (HMAC
//! construction), adapted from Slack's HMAC-SHA256/hex scheme to Twilio's
//! actual HMAC-SHA1/base64-over-url-plus-sorted-params scheme.

pub mod stream;

use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use std::collections::HashMap;

use crate::error::TelephonySignatureError;
use crate::server::AppState;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Deserialize)]
pub struct IncomingCallForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "CallStatus", default)]
    #[allow(dead_code)]
    pub call_status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusCallbackForm {
    #[serde(rename = "CallSid")]
    #[allow(dead_code)]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    #[allow(dead_code)]
    pub call_status: String,
    #[serde(rename = "CallDuration", default)]
    #[allow(dead_code)]
    pub call_duration: Option<u64>,
}

/// What the webhook handler learns about a call before the audio WebSocket
/// connects — cached by `call_sid` and consumed once `stream.rs` sees the
/// matching `start` event.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub assistant_id: String,
    pub organization_id: String,
    pub twilio_auth_token: Option<String>,
    pub caller_number: String,
}

/// `POST /voice/incoming`. Resolves the assistant via the
/// configuration service and responds with TwiML connecting the caller to
/// the audio stream, or a fixed error TwiML if no assistant was returned.
pub async fn incoming(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<IncomingCallForm>,
) -> Response {
    let resolved = state.configservice.incoming_call(&form.call_sid, &form.from, &form.to).await;
    let resolved = match resolved {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(call_sid = %form.call_sid, error = %e, "configuration service unreachable for incoming call");
            return twiml_response(error_twiml());
        }
    };

    let Some(assistant_id) = resolved.assistant_id else {
        tracing::warn!(call_sid = %form.call_sid, "no assistant configured for incoming call");
        return twiml_response(error_twiml());
    };
    let organization_id = resolved.organization_id.unwrap_or_default();

    // Signature validation uses the auth token the configuration service just
    // returned for this call, not a process-level secret — it is skipped
    // entirely when that token is absent.
    if state.config.twilio.validate_signatures {
        if let Some(auth_token) = resolved.twilio_auth_token.as_deref() {
            let host = request_host(&headers);
            let url = format!("https://{host}/voice/incoming");
            if let Err(e) = validate_webhook_signature(
                auth_token,
                &headers,
                &url,
                &[
                    ("CallSid", form.call_sid.as_str()),
                    ("From", form.from.as_str()),
                    ("To", form.to.as_str()),
                ],
            ) {
                tracing::warn!(call_sid = %form.call_sid, error = %e, "rejecting incoming webhook: signature validation failed");
                return (StatusCode::FORBIDDEN, "signature validation failed").into_response();
            }
        }
    }

    state.pending_calls.lock().await.insert(
        form.call_sid.clone(),
        PendingCall {
            assistant_id,
            organization_id,
            twilio_auth_token: resolved.twilio_auth_token,
            caller_number: form.from.clone(),
        },
    );

    let host = request_host(&headers);
    let stream_url = format!("wss://{host}/voice/stream/{}", form.call_sid);
    twiml_response(connect_stream_twiml(&stream_url))
}

fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string()
}

/// `POST /voice/status`. Mirrors the status webhook to the
/// configuration service and always returns 200.
pub async fn status(State(state): State<AppState>, Form(form): Form<StatusCallbackForm>) -> StatusCode {
    if let Err(e) = state
        .configservice
        .call_status(&form.call_sid, &form.call_status, form.call_duration)
        .await
    {
        tracing::warn!(call_sid = %form.call_sid, error = %e, "failed to mirror status callback");
    }
    StatusCode::OK
}

fn twiml_response(xml: String) -> Response {
    (StatusCode::OK, [("Content-Type", "text/xml")], xml).into_response()
}

fn connect_stream_twiml(stream_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="{stream_url}"/></Connect></Response>"#
    )
}

/// Fixed TwiML spoken when no assistant could be resolved for a call.
pub fn error_twiml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?><Response><Say>We're sorry, this call cannot be completed right now.</Say><Hangup/></Response>"#.to_string()
}

/// TwiML for `transfer_to_number`: `<Dial><Number>` for a
/// conference-style bridge, `<Dial><Sip>` for a SIP REFER-style transfer.
pub fn transfer_to_number_twiml(phone_number: &str, transfer_type: crate::tools::TransferType) -> String {
    use crate::tools::TransferType;
    let dial_target = match transfer_type {
        TransferType::Conference => format!("<Number>{}</Number>", xml_escape(phone_number)),
        TransferType::SipRefer => format!("<Sip>{}</Sip>", xml_escape(phone_number)),
    };
    format!(r#"<?xml version="1.0" encoding="UTF-8"?><Response><Dial>{dial_target}</Dial></Response>"#)
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Validates Twilio's `X-Twilio-Signature` header: HMAC-SHA1 over the fully
/// qualified URL with sorted `key+value` pairs appended, base64-encoded
/// (Twilio's actual algorithm — distinct from Slack's HMAC-SHA256/hex
/// `v0:timestamp:body` scheme this is grounded on).
pub fn validate_webhook_signature(
    auth_token: &str,
    headers: &HeaderMap,
    url: &str,
    params: &[(&str, &str)],
) -> Result<(), TelephonySignatureError> {
    let signature = headers
        .get("X-Twilio-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(TelephonySignatureError::MissingHeader)?;

    let expected = compute_twilio_signature(auth_token, url, params);
    if expected == signature {
        Ok(())
    } else {
        Err(TelephonySignatureError::Mismatch)
    }
}

fn compute_twilio_signature(auth_token: &str, url: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<&(&str, &str)> = params.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);

    let mut basestring = url.to_string();
    for (key, value) in sorted {
        basestring.push_str(key);
        basestring.push_str(value);
    }

    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes()).expect("HMAC accepts any key length");
    mac.update(basestring.as_bytes());
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, mac.finalize().into_bytes())
}

/// Per-account Twilio REST client for call-control actions the pipeline
/// issues during transfer/hangup. Built once per call from
/// `CallSession::telephony_credentials` and never recreated.
pub struct TelephonyRestClient {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
}

impl TelephonyRestClient {
    pub fn new(account_sid: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), account_sid: account_sid.into(), auth_token: auth_token.into() }
    }

    fn calls_url(&self, call_sid: &str) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls/{}.json",
            self.account_sid, call_sid
        )
    }

    /// Ends the call immediately via `Status=completed`.
    pub async fn hangup(&self, call_sid: &str) -> anyhow::Result<()> {
        self.update(call_sid, &[("Status", "completed")]).await
    }

    /// Redirects the active call to new TwiML (used for transfer-to-number).
    pub async fn update_twiml(&self, call_sid: &str, twiml: &str) -> anyhow::Result<()> {
        self.update(call_sid, &[("Twiml", twiml)]).await
    }

    /// Redirects the active call to a new webhook URL (used for
    /// transfer-to-agent once the target webhook is resolved).
    pub async fn update_url(&self, call_sid: &str, url: &str) -> anyhow::Result<()> {
        self.update(call_sid, &[("Url", url)]).await
    }

    async fn update(&self, call_sid: &str, form: &[(&str, &str)]) -> anyhow::Result<()> {
        let mut body: HashMap<&str, &str> = HashMap::new();
        for (k, v) in form {
            body.insert(k, v);
        }
        self.http
            .post(self.calls_url(call_sid))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&body)
            .send()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_twiml_says_and_hangs_up() {
        let xml = error_twiml();
        assert!(xml.contains("<Hangup/>"));
        assert!(xml.contains("<Say>"));
    }

    #[test]
    fn connect_twiml_embeds_stream_url() {
        let xml = connect_stream_twiml("wss://example.test/voice/stream/CA123");
        assert!(xml.contains(r#"url="wss://example.test/voice/stream/CA123""#));
    }

    #[test]
    fn transfer_twiml_picks_number_or_sip_tag_by_type() {
        use crate::tools::TransferType;
        let number = transfer_to_number_twiml("+15551234567", TransferType::Conference);
        assert!(number.contains("<Number>+15551234567</Number>"));
        let sip = transfer_to_number_twiml("sip:agent@example.test", TransferType::SipRefer);
        assert!(sip.contains("<Sip>sip:agent@example.test</Sip>"));
    }

    #[test]
    fn xml_escape_handles_ampersand_and_angle_brackets() {
        assert_eq!(xml_escape("a&b<c>"), "a&amp;b&lt;c&gt;");
    }

    #[test]
    fn twilio_signature_matches_known_vector() {
        // Signature computed for a simple single-param request against a
        // fixed auth token, verifying the sorted key+value concatenation
        // and base64 encoding shape (not a vendor-published test vector,
        // since Twilio does not publish one under an open license).
        let sig = compute_twilio_signature(
            "test_auth_token",
            "https://example.test/voice/incoming",
            &[("CallSid", "CA123"), ("From", "+15551234567"), ("To", "+15557654321")],
        );
        // Recomputing with params reordered must produce the same signature
        // because the params are sorted before hashing.
        let sig_reordered = compute_twilio_signature(
            "test_auth_token",
            "https://example.test/voice/incoming",
            &[("To", "+15557654321"), ("CallSid", "CA123"), ("From", "+15551234567")],
        );
        assert_eq!(sig, sig_reordered);
    }
}
