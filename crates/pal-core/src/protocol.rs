//! Messages exchanged with the display side over the host channel.
//!
//! Each line on the channel is one JSON object. Requests and unsolicited
//! events carry an `action` tag; replies echo the request `id`.

use serde::{Deserialize, Serialize};

use crate::classify::ErrorCategory;
use crate::ids::RequestId;
use crate::messages::Conversation;
use crate::stream::StreamIncrement;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum HostRequest {
    #[serde(rename = "callClaudeAPI")]
    CallClaudeApi {
        prompt: String,
        #[serde(default)]
        conversation: Conversation,
    },
    #[serde(rename_all = "camelCase")]
    StopStreaming { request_id: RequestId },
    #[serde(rename_all = "camelCase")]
    VerifyApiKey {
        #[serde(default)]
        api_key: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SaveSettings {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    GetSettings,
}

impl HostRequest {
    pub fn action(&self) -> &'static str {
        match self {
            Self::CallClaudeApi { .. } => "callClaudeAPI",
            Self::StopStreaming { .. } => "stopStreaming",
            Self::VerifyApiKey { .. } => "verifyApiKey",
            Self::SaveSettings { .. } => "saveSettings",
            Self::GetSettings => "getSettings",
        }
    }
}

/// A request plus the correlation id the caller wants echoed back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub request: HostRequest,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl HostResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn streaming(request_id: RequestId) -> Self {
        Self {
            success: true,
            request_id: Some(request_id),
            streaming: Some(true),
            ..Self::default()
        }
    }

    pub fn data(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }

    /// A stop request that found nothing to stop is not an error, just `success: false`.
    pub fn flag(success: bool) -> Self {
        Self {
            success,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            category: Some(category),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: Option<serde_json::Value>) -> Self {
        self.id = id;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Error,
}

/// Unsolicited messages pushed to the display side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum HostEvent {
    StreamUpdate(StreamIncrement),
    ShowNotification {
        message: String,
        #[serde(rename = "type")]
        kind: NotificationKind,
    },
}

/// Anything written to the host channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    Event(HostEvent),
    Response(HostResponse),
}
