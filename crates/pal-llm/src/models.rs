use serde::{Deserialize, Serialize};

/// Model used by the degraded verification probe.
pub const PROBE_MODEL: &str = "claude-3-haiku-20240307";

/// A selectable model as shown in the settings UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

impl ModelDescriptor {
    pub fn new(id: &str, display_name: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
        }
    }
}

/// Returned when the model listing is unreachable but the key looks usable.
pub fn default_models() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::new(
            "claude-3-opus-20240229",
            "Claude 3 Opus",
            "Most powerful model for complex tasks",
        ),
        ModelDescriptor::new(
            "claude-3-sonnet-20240229",
            "Claude 3 Sonnet",
            "Balanced model for most tasks",
        ),
        ModelDescriptor::new(
            PROBE_MODEL,
            "Claude 3 Haiku",
            "Fastest and most compact model",
        ),
    ]
}
