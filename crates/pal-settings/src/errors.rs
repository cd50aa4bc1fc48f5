//! Settings error types.

use thiserror::Error;

/// Errors that can occur when loading, saving, or decrypting settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read or write a settings file.
    #[error("failed to access settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid JSON for our schema.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The stored API key could not be sealed or opened.
    #[error("secret storage error: {0}")]
    Secret(#[from] crate::secrets::SecretError),
    /// A settings value was invalid (e.g., empty API key).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
