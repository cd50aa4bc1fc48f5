//! Maps raw failures into the small set of categories the user is shown.
//!
//! Classification order: the error variant itself, then the HTTP status, then
//! a substring scan of the description.

use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingCredential,
    InvalidCredential,
    RateLimited,
    NetworkError,
    ServerError,
    MalformedResponse,
    Unknown,
}

impl ErrorCategory {
    /// Fixed user-facing text. `Unknown` has none; the raw message is used instead.
    pub fn template(&self) -> Option<&'static str> {
        match self {
            Self::MissingCredential => Some(
                "API key not found. Please set your Anthropic API key in the ReadingPal settings.",
            ),
            Self::InvalidCredential => Some(
                "Your API key appears to be invalid or unauthorized. Please check it in the settings.",
            ),
            Self::RateLimited => {
                Some("You've hit a rate limit. Please wait a moment before trying again.")
            }
            Self::NetworkError => Some(
                "Could not reach the Anthropic API. Check your connection and try again.",
            ),
            Self::ServerError => {
                Some("The Anthropic API is having trouble right now. Please try again shortly.")
            }
            Self::MalformedResponse => {
                Some("Received an unexpected response from the Anthropic API.")
            }
            Self::Unknown => None,
        }
    }
}

/// A category together with the raw text it was derived from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classified {
    pub category: ErrorCategory,
    pub raw: String,
}

impl Classified {
    pub fn user_message(&self) -> String {
        match self.category.template() {
            Some(text) => text.to_string(),
            None => self.raw.clone(),
        }
    }
}

pub fn classify_status(status: u16) -> Option<ErrorCategory> {
    match status {
        401 | 403 => Some(ErrorCategory::InvalidCredential),
        429 => Some(ErrorCategory::RateLimited),
        500..=599 => Some(ErrorCategory::ServerError),
        _ => None,
    }
}

const NETWORK_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "cors",
    "failed to fetch",
    "connection",
    "dns",
];

pub fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorCategory::NetworkError
    } else {
        ErrorCategory::Unknown
    }
}

pub fn classify(error: &GatewayError) -> Classified {
    let raw = error.to_string();
    let category = match error {
        GatewayError::MissingCredential => ErrorCategory::MissingCredential,
        GatewayError::InvalidCredential(_) => ErrorCategory::InvalidCredential,
        GatewayError::MalformedResponse(_) => ErrorCategory::MalformedResponse,
        GatewayError::NetworkError(_) => ErrorCategory::NetworkError,
        GatewayError::RequestRejected { status, message } => {
            classify_status(*status).unwrap_or_else(|| classify_message(message))
        }
        GatewayError::VerificationFailed(message) | GatewayError::StreamInterrupted(message) => {
            classify_message(message)
        }
        GatewayError::InvalidSettings(_) => ErrorCategory::Unknown,
    };
    Classified { category, raw }
}
