use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message types understood by the extension contexts.
///
/// The set is closed. Adding a variant is backward compatible, renaming or
/// removing one breaks every context still sending it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    StartRecording,
    StopRecording,
    PauseRecording,
    ResumeRecording,
    GetStatus,
    ShowRecorderPopup,
    ReportStatus,
}

/// A request or notification travelling between contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    pub fn with_payload(kind: MessageType, payload: Map<String, Value>) -> Self {
        Self {
            kind,
            payload: Some(payload),
        }
    }

    /// Look up a string field in the payload
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.as_ref()?.get(field)?.as_str()
    }
}

/// Reply to a request-style message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const NO_HANDLER_ERROR: &str = "No handler found for this message type";

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }

    pub fn ok_with(data: Value) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: None,
        }
    }

    pub fn no_handler() -> Self {
        Self::failure(NO_HANDLER_ERROR)
    }
}
