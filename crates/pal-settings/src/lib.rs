//! Persisted configuration: where the API key and model choice live, and how
//! the pipeline gets at them.

pub mod errors;
pub mod loader;
pub mod resolver;
pub mod secrets;
pub mod store;
pub mod types;

pub use errors::{Result, SettingsError};
pub use resolver::{CredentialResolver, Credentials, SettingsResolver, StaticResolver};
pub use store::SettingsStore;
pub use types::{ApiKey, ApiSettings, PalSettings, DEFAULT_MODEL};
