//! API key verification.
//!
//! Primary path lists models via `GET /v1/models`. When that request cannot
//! be sent at all, a one-token probe decides whether the key is usable and the
//! built-in model list is returned instead.

use std::time::Duration;

use pal_core::errors::GatewayError;
use pal_settings::{ApiKey, ApiSettings};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::api::{self, AnthropicApi, MessagesRequest};
use crate::models::{default_models, ModelDescriptor};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

const PARSE_FAILED: &str = "failed to parse API response";

pub struct Verifier {
    api: AnthropicApi,
}

impl Verifier {
    pub fn new(api: AnthropicApi) -> Self {
        Self { api }
    }

    pub fn from_settings(settings: &ApiSettings) -> Result<Self, GatewayError> {
        Ok(Self::new(
            AnthropicApi::new(settings)?.with_request_timeout(VERIFY_TIMEOUT),
        ))
    }

    #[instrument(skip_all)]
    pub async fn verify(&self, api_key: &ApiKey) -> Result<Vec<ModelDescriptor>, GatewayError> {
        if api_key.is_blank() {
            return Err(GatewayError::InvalidCredential("API key is required".into()));
        }

        match self.api.list_models(api_key).await {
            Ok(response) => read_listing(response).await,
            Err(e) => {
                warn!(error = %e, "model listing unreachable, falling back to probe");
                self.probe(api_key).await
            }
        }
    }

    async fn probe(&self, api_key: &ApiKey) -> Result<Vec<ModelDescriptor>, GatewayError> {
        match self.api.post_messages(api_key, &MessagesRequest::probe()).await {
            Ok(response) if matches!(response.status().as_u16(), 401 | 403) => {
                warn!(status = response.status().as_u16(), "probe rejected the key");
                Err(GatewayError::InvalidCredential(
                    "API key is invalid or unauthorized".into(),
                ))
            }
            Ok(response) => {
                debug!(status = response.status().as_u16(), "probe accepted the key");
                Ok(default_models())
            }
            Err(e) => {
                warn!(error = %e, "probe unreachable, assuming key is usable");
                Ok(default_models())
            }
        }
    }
}

async fn read_listing(response: reqwest::Response) -> Result<Vec<ModelDescriptor>, GatewayError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = match api::error_detail(&body) {
            Some(detail) => format!("API Error: {detail}"),
            None => api::status_line(status),
        };
        warn!(status = status.as_u16(), %message, "model listing rejected");
        return Err(match status.as_u16() {
            401 | 403 => GatewayError::InvalidCredential(message),
            _ => GatewayError::VerificationFailed(message),
        });
    }

    let body = response
        .text()
        .await
        .map_err(|_| GatewayError::VerificationFailed(PARSE_FAILED.into()))?;
    let listing: Value = serde_json::from_str(&body)
        .map_err(|_| GatewayError::VerificationFailed(PARSE_FAILED.into()))?;
    let models = parse_listing(&listing)?;
    info!(count = models.len(), "API key verified");
    Ok(models)
}

fn parse_listing(listing: &Value) -> Result<Vec<ModelDescriptor>, GatewayError> {
    if listing.is_null() {
        return Err(GatewayError::VerificationFailed(
            "received empty response from API".into(),
        ));
    }
    let Some(data) = listing.get("data").and_then(Value::as_array) else {
        return Err(GatewayError::VerificationFailed(
            "unexpected API response format".into(),
        ));
    };

    let models: Vec<ModelDescriptor> = data.iter().map(descriptor).collect();
    if models.is_empty() {
        return Err(GatewayError::VerificationFailed(
            "no models found in API response".into(),
        ));
    }
    Ok(models)
}

fn descriptor(entry: &Value) -> ModelDescriptor {
    let text = |key: &str| {
        entry
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let id = text("id").unwrap_or_default();
    let display_name = text("name")
        .or_else(|| text("display_name"))
        .unwrap_or_else(|| id.clone());
    ModelDescriptor {
        id,
        display_name,
        description: text("description").unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn verifier(base_url: String) -> Verifier {
        let settings = ApiSettings {
            base_url,
            connect_timeout_secs: 2,
            ..ApiSettings::default()
        };
        Verifier::new(
            AnthropicApi::new(&settings)
                .unwrap()
                .with_request_timeout(Duration::from_millis(300)),
        )
    }

    fn key() -> ApiKey {
        ApiKey::new("sk-test")
    }

    #[tokio::test]
    async fn lists_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "claude-3-5-sonnet", "display_name": "Claude 3.5 Sonnet"},
                    {"id": "claude-x", "name": "X", "description": "desc"},
                    {"id": "claude-bare"}
                ],
                "has_more": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let models = verifier(server.uri()).verify(&key()).await.unwrap();
        assert_eq!(models.len(), 3);
        assert_eq!(models[0].display_name, "Claude 3.5 Sonnet");
        assert_eq!(models[1], ModelDescriptor::new("claude-x", "X", "desc"));
        assert_eq!(models[2].display_name, "claude-bare");
        assert_eq!(models[2].description, "");
    }

    #[tokio::test]
    async fn unauthorized_is_invalid_credential() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "type": "error",
                "error": {"type": "authentication_error", "message": "invalid x-api-key"}
            })))
            .mount(&server)
            .await;

        let err = verifier(server.uri()).verify(&key()).await.unwrap_err();
        assert!(
            matches!(&err, GatewayError::InvalidCredential(m) if m == "API Error: invalid x-api-key"),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn other_status_is_verification_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let err = verifier(server.uri()).verify(&key()).await.unwrap_err();
        assert!(
            matches!(&err, GatewayError::VerificationFailed(m) if m == "API Error: 404 Not Found"),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn error_type_used_when_message_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(json!({"error": {"type": "api_error"}})),
            )
            .mount(&server)
            .await;

        let err = verifier(server.uri()).verify(&key()).await.unwrap_err();
        assert!(matches!(&err, GatewayError::VerificationFailed(m) if m == "API Error: api_error"));
    }

    #[tokio::test]
    async fn empty_and_malformed_listings_fail() {
        for (body, expected) in [
            (json!({"data": []}), "no models found in API response"),
            (json!({"models": []}), "unexpected API response format"),
            (json!(null), "received empty response from API"),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .mount(&server)
                .await;
            let err = verifier(server.uri()).verify(&key()).await.unwrap_err();
            assert!(
                matches!(&err, GatewayError::VerificationFailed(m) if m == expected),
                "got: {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn unparseable_body_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = verifier(server.uri()).verify(&key()).await.unwrap_err();
        assert!(matches!(&err, GatewayError::VerificationFailed(m) if m == PARSE_FAILED));
    }

    #[tokio::test]
    async fn blank_key_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = verifier(server.uri())
            .verify(&ApiKey::new("  "))
            .await
            .unwrap_err();
        assert!(matches!(&err, GatewayError::InvalidCredential(m) if m == "API key is required"));
    }

    #[tokio::test]
    async fn unreachable_listing_with_accepting_probe_returns_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({
                "model": "claude-3-haiku-20240307",
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "Test"}]
            })))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"type": "invalid_request_error", "message": "bad"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let models = verifier(server.uri()).verify(&key()).await.unwrap();
        assert_eq!(models, default_models());
    }

    #[tokio::test]
    async fn unreachable_listing_with_rejecting_probe_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = verifier(server.uri()).verify(&key()).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCredential(_)));
    }

    #[tokio::test]
    async fn fully_unreachable_returns_defaults() {
        let models = verifier("http://127.0.0.1:9".into())
            .verify(&key())
            .await
            .unwrap();
        assert_eq!(models.len(), 3);
    }

    #[test]
    fn descriptor_fallbacks() {
        let d = descriptor(&json!({"id": "m1", "name": ""}));
        assert_eq!(d.display_name, "m1");
        let d = descriptor(&json!({}));
        assert_eq!(d.id, "");
        assert_eq!(d.display_name, "");
    }
}
