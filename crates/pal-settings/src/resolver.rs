//! Resolves the credential and model for a single request.
//!
//! Resolution happens per request so a key saved mid-session is picked up by
//! the next call without a restart.

use async_trait::async_trait;
use pal_core::errors::GatewayError;
use tracing::warn;

use crate::loader;
use crate::store::SettingsStore;
use crate::types::{ApiKey, DEFAULT_MODEL};

#[derive(Clone, Debug)]
pub struct Credentials {
    pub api_key: ApiKey,
    pub model: String,
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// `MissingCredential` when no non-blank key is available.
    async fn resolve(&self) -> Result<Credentials, GatewayError>;
}

/// Environment key first, then the sealed key in the settings store.
#[derive(Clone, Debug)]
pub struct SettingsResolver {
    store: SettingsStore,
}

impl SettingsResolver {
    pub fn new(store: SettingsStore) -> Self {
        Self { store }
    }

    fn resolve_with<F>(&self, lookup: F) -> Result<Credentials, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = self
            .store
            .load_file()
            .map_err(|e| GatewayError::InvalidSettings(e.to_string()))?;
        loader::apply_env_overrides(&mut settings, &lookup);
        let model = settings.model_or_default().to_string();

        let api_key = match loader::env_api_key(&lookup) {
            Some(key) => key,
            None => match self.store.stored_api_key() {
                Ok(Some(key)) => key,
                Ok(None) => return Err(GatewayError::MissingCredential),
                Err(e) => {
                    warn!(error = %e, "stored API key unreadable");
                    return Err(GatewayError::InvalidSettings(e.to_string()));
                }
            },
        };

        Ok(Credentials { api_key, model })
    }
}

#[async_trait]
impl CredentialResolver for SettingsResolver {
    async fn resolve(&self) -> Result<Credentials, GatewayError> {
        self.resolve_with(|name| std::env::var(name).ok())
    }
}

/// Fixed credentials, for tests and one-shot CLI overrides.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    pub api_key: Option<ApiKey>,
    pub model: Option<String>,
}

impl StaticResolver {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(ApiKey::new(api_key)),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticResolver {
    async fn resolve(&self) -> Result<Credentials, GatewayError> {
        let api_key = self
            .api_key
            .clone()
            .filter(|k| !k.is_blank())
            .ok_or(GatewayError::MissingCredential)?;
        let model = self
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Ok(Credentials { api_key, model })
    }
}
