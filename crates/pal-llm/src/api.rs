//! HTTP surface of the Messages API: endpoints, headers, request bodies and
//! error-body parsing.

use std::time::Duration;

use pal_core::errors::GatewayError;
use pal_core::messages::WireMessage;
use pal_settings::{ApiKey, ApiSettings};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SYSTEM_PROMPT: &str = "You are Claude, an AI assistant helping users understand text they've selected from webpages. Be concise, helpful, and accurate.";
pub const PROBE_SYSTEM_PROMPT: &str = "You are a test system. Reply with 'OK'.";
pub const PROBE_MESSAGE: &str = "Test";

/// Body of `POST /v1/messages`.
#[derive(Clone, Debug, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub stream: bool,
    pub system: String,
    pub messages: Vec<WireMessage>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl MessagesRequest {
    pub fn streaming(model: impl Into<String>, max_tokens: u32, messages: Vec<WireMessage>) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            stream: true,
            system: SYSTEM_PROMPT.to_string(),
            messages,
        }
    }

    /// Cheapest possible request, used only to see whether the key is accepted.
    pub fn probe() -> Self {
        Self {
            model: crate::models::PROBE_MODEL.to_string(),
            max_tokens: 1,
            stream: false,
            system: PROBE_SYSTEM_PROMPT.to_string(),
            messages: vec![WireMessage::user(PROBE_MESSAGE)],
        }
    }
}

/// Thin client over one base URL. Cheap to clone.
#[derive(Clone, Debug)]
pub struct AnthropicApi {
    client: Client,
    base_url: String,
    anthropic_version: String,
    request_timeout: Option<Duration>,
}

impl AnthropicApi {
    pub fn new(settings: &ApiSettings) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            anthropic_version: settings.anthropic_version.clone(),
            request_timeout: None,
        })
    }

    /// Cap on a whole request/response exchange. Left unset for streaming;
    /// the read loop enforces its own idle timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn with_headers(&self, req: RequestBuilder, api_key: &ApiKey) -> RequestBuilder {
        let req = match self.request_timeout {
            Some(timeout) => req.timeout(timeout),
            None => req,
        };
        req.header("x-api-key", api_key.expose())
            .header("anthropic-version", &self.anthropic_version)
            .header("anthropic-dangerous-direct-browser-access", "true")
            .header("content-type", "application/json")
    }

    pub async fn post_messages(
        &self,
        api_key: &ApiKey,
        body: &MessagesRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}/v1/messages", self.base_url);
        self.with_headers(self.client.post(url), api_key)
            .json(body)
            .send()
            .await
    }

    pub async fn list_models(&self, api_key: &ApiKey) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}/v1/models", self.base_url);
        self.with_headers(self.client.get(url), api_key).send().await
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<Value>,
}

/// `error.message` from an API error body.
pub fn error_message(body: &str) -> Option<String> {
    let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
    envelope
        .error?
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// `error.message`, else `error.type`, else the raw `error` JSON.
pub fn error_detail(body: &str) -> Option<String> {
    let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
    let error = envelope.error.filter(|e| !e.is_null())?;
    let field = |name: &str| {
        error
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    field("message")
        .or_else(|| field("type"))
        .or_else(|| Some(error.to_string()))
}

/// `"API Error: 429 Too Many Requests"`.
pub fn status_line(status: StatusCode) -> String {
    format!(
        "API Error: {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .trim_end()
    .to_string()
}
