//! Read/write access to the settings directory.
//!
//! The API key is sealed with the per-install [`SecretKey`] before it touches
//! disk. Writes go through a temp file and a rename so a crash never leaves a
//! half-written `settings.json`.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::{Result, SettingsError};
use crate::loader::{self, secret_key_path, settings_path};
use crate::secrets::SecretKey;
use crate::types::{ApiKey, PalSettings};

#[derive(Clone, Debug)]
pub struct SettingsStore {
    dir: PathBuf,
}

impl SettingsStore {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$READINGPAL_HOME`, or `~/.readingpal`.
    pub fn default_location() -> Self {
        Self::open(loader::pal_home())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings_path(&self) -> PathBuf {
        settings_path(&self.dir)
    }

    /// File values plus environment overrides.
    pub fn load(&self) -> Result<PalSettings> {
        loader::load_settings_from_path(&self.settings_path())
    }

    /// File values only.
    pub fn load_file(&self) -> Result<PalSettings> {
        loader::load_file(&self.settings_path())
    }

    pub fn write(&self, settings: &PalSettings) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.settings_path();
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(settings)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        debug!(?path, "settings written");
        Ok(())
    }

    pub fn save_api_key(&self, api_key: &str) -> Result<()> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(SettingsError::InvalidValue("API key is required".into()));
        }
        let key = SecretKey::load_or_create(&secret_key_path(&self.dir))?;
        let mut settings = self.load_file()?;
        settings.api_key = Some(key.seal(api_key)?);
        self.write(&settings)?;
        info!("API key saved");
        Ok(())
    }

    pub fn clear_api_key(&self) -> Result<()> {
        let mut settings = self.load_file()?;
        if settings.api_key.take().is_some() {
            self.write(&settings)?;
            info!("API key cleared");
        }
        Ok(())
    }

    /// `None` or a blank string resets to the default model.
    pub fn save_model(&self, model: Option<&str>) -> Result<()> {
        let mut settings = self.load_file()?;
        settings.model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        self.write(&settings)?;
        debug!(model = ?settings.model, "model saved");
        Ok(())
    }

    /// Stored key, unsealed. Environment keys are not consulted here.
    pub fn stored_api_key(&self) -> Result<Option<ApiKey>> {
        let settings = self.load_file()?;
        let Some(sealed) = settings.api_key else {
            return Ok(None);
        };
        let key_path = secret_key_path(&self.dir);
        if !key_path.exists() {
            return Err(SettingsError::InvalidValue(
                "stored API key present but secret key file is missing".into(),
            ));
        }
        let key = SecretKey::load_or_create(&key_path)?;
        let plain = key.open(&sealed)?;
        Ok(Some(ApiKey::new(plain)).filter(|k| !k.is_blank()))
    }
}
