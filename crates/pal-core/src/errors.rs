/// Typed error hierarchy for the streaming pipeline and key verification.
/// Nothing in here is retried automatically; the caller decides what the user sees.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    // Configuration: fixed by the user in settings
    #[error(
        "API key not found. Please set your Anthropic API key in the ReadingPal settings \
         (readingpal config set-key <KEY>)."
    )]
    MissingCredential,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("could not read settings: {0}")]
    InvalidSettings(String),

    // Provider said no
    #[error("{message}")]
    RequestRejected { status: u16, message: String },
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    // Transport
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

pub const AUTH_HINT: &str =
    "Your API key may be invalid. Please check your Anthropic API key in the settings.";
pub const RATE_LIMIT_HINT: &str =
    "You've hit a rate limit. Please wait a moment before trying again.";

impl GatewayError {
    /// Build a `RequestRejected`, appending the actionable hint for auth and
    /// rate-limit statuses.
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = match status {
            401 | 403 => format!("{message}. {AUTH_HINT}"),
            429 => format!("{message}. {RATE_LIMIT_HINT}"),
            _ => message,
        };
        Self::RequestRejected { status, message }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RequestRejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Errors that only a settings change can fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::MissingCredential | Self::InvalidCredential(_) | Self::InvalidSettings(_) => true,
            Self::RequestRejected { status, .. } => matches!(status, 401 | 403),
            _ => false,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::InvalidCredential(_) => "invalid_credential",
            Self::InvalidSettings(_) => "invalid_settings",
            Self::RequestRejected { .. } => "request_rejected",
            Self::VerificationFailed(_) => "verification_failed",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::MalformedResponse(_) => "malformed_response",
        }
    }
}
