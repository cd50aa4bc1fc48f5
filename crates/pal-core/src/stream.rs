use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

/// How a stream ended. Present only on the terminal increment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEnd {
    Completed,
    Cancelled,
    Failed,
}

/// One update for the display surface.
///
/// Zero or more `done: false` increments are followed by exactly one
/// `done: true` increment per request id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamIncrement {
    pub request_id: RequestId,
    pub text: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StreamEnd>,
}

impl StreamIncrement {
    pub fn delta(request_id: RequestId, text: impl Into<String>) -> Self {
        Self {
            request_id,
            text: text.into(),
            done: false,
            status: None,
        }
    }

    pub fn terminal(request_id: RequestId, end: StreamEnd) -> Self {
        Self {
            request_id,
            text: String::new(),
            done: true,
            status: Some(end),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == Some(StreamEnd::Cancelled)
    }
}
