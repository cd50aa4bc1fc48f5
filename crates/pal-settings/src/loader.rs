//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PalSettings::default()`]
//! 2. If `<home>/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ApiKey, PalSettings};

pub const ENV_HOME: &str = "READINGPAL_HOME";
pub const ENV_API_KEY: &str = "READINGPAL_API_KEY";
pub const ENV_ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const ENV_MODEL: &str = "READINGPAL_MODEL";
pub const ENV_API_URL: &str = "READINGPAL_API_URL";
pub const ENV_MAX_TOKENS: &str = "READINGPAL_MAX_TOKENS";
pub const ENV_IDLE_TIMEOUT: &str = "READINGPAL_IDLE_TIMEOUT";

/// Directory holding settings, the secret key, and the conversation file.
pub fn pal_home() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_HOME) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".readingpal")
}

pub fn settings_path(dir: &Path) -> PathBuf {
    dir.join("settings.json")
}

pub fn secret_key_path(dir: &Path) -> PathBuf {
    dir.join("secret_key")
}

/// Read the settings file only, no environment. Missing file yields defaults.
pub fn load_file(path: &Path) -> Result<PalSettings> {
    let defaults = serde_json::to_value(PalSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Settings file plus process environment overrides.
pub fn load_settings_from_path(path: &Path) -> Result<PalSettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides. Unparseable or out-of-range values are
/// ignored and the file/default value stays.
pub fn apply_env_overrides<F>(settings: &mut PalSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = read_string(&lookup, ENV_MODEL) {
        settings.model = Some(v);
    }
    if let Some(v) = read_string(&lookup, ENV_API_URL) {
        settings.api.base_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = read_u64(&lookup, ENV_MAX_TOKENS, 1, 200_000) {
        settings.api.max_tokens = v as u32;
    }
    if let Some(v) = read_u64(&lookup, ENV_IDLE_TIMEOUT, 1, 3600) {
        settings.api.idle_timeout_secs = v;
    }
}

/// API key from the environment, `READINGPAL_API_KEY` first.
pub fn env_api_key<F>(lookup: F) -> Option<ApiKey>
where
    F: Fn(&str) -> Option<String>,
{
    read_string(&lookup, ENV_API_KEY)
        .or_else(|| read_string(&lookup, ENV_ANTHROPIC_API_KEY))
        .map(ApiKey::new)
}

fn read_string<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_u64<F>(lookup: &F, name: &str, min: u64, max: u64) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    read_string(lookup, name)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| (min..=max).contains(v))
}
