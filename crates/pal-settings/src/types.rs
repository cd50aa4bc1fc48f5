use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Model used when the user never picked one.
pub const DEFAULT_MODEL: &str = "claude-3-opus-20240229";

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Everything persisted in `settings.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PalSettings {
    /// Sealed API key (base64 nonce + ciphertext), never the plaintext.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Selected model id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub api: ApiSettings,
}

impl PalSettings {
    pub fn model_or_default(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_MODEL)
    }
}

/// Endpoint and request shaping for the Messages API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    pub base_url: String,
    pub anthropic_version: String,
    /// Token cap for streamed completions.
    pub max_tokens: u32,
    /// Seconds without a body chunk before a stream is considered dead.
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            idle_timeout_secs: 90,
            connect_timeout_secs: 30,
        }
    }
}

/// Wraps an API key with secrecy protection (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_blank(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_debug_redacted() {
        let key = ApiKey::new("sk-ant-12345");
        let debug = format!("{key:?}");
        assert!(!debug.contains("sk-ant"), "key leaked in debug: {debug}");
        assert_eq!(key.expose(), "sk-ant-12345");
    }

    #[test]
    fn blank_key_detection() {
        assert!(ApiKey::new("   ").is_blank());
        assert!(!ApiKey::new("sk").is_blank());
    }

    #[test]
    fn defaults() {
        let s = PalSettings::default();
        assert_eq!(s.model_or_default(), DEFAULT_MODEL);
        assert_eq!(s.api.max_tokens, 1024);
        assert_eq!(s.api.base_url, "https://api.anthropic.com");
        assert_eq!(s.api.anthropic_version, "2023-06-01");
    }

    #[test]
    fn blank_model_falls_back_to_default() {
        let s = PalSettings {
            model: Some(String::new()),
            ..PalSettings::default()
        };
        assert_eq!(s.model_or_default(), DEFAULT_MODEL);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: PalSettings =
            serde_json::from_str(r#"{"model":"claude-3-haiku-20240307","api":{"maxTokens":256}}"#)
                .unwrap();
        assert_eq!(s.model_or_default(), "claude-3-haiku-20240307");
        assert_eq!(s.api.max_tokens, 256);
        assert_eq!(s.api.idle_timeout_secs, 90);
    }

    #[test]
    fn serializes_camel_case_without_empty_key() {
        let json = serde_json::to_value(PalSettings::default()).unwrap();
        assert!(json.get("apiKey").is_none());
        assert_eq!(json["api"]["baseUrl"], "https://api.anthropic.com");
    }
}
