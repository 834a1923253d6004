//! Typed request, response and stream frame bodies

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Outbound messages request
#[derive(Debug, Clone, Serialize)]
pub struct MessageRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// Single-shot response; unknown fields are ignored
#[derive(Debug, Clone, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub block_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageResponse {
    /// Text of the first content block
    pub fn first_text(&self) -> Option<&str> {
        self.content.first().and_then(|b| b.text.as_deref())
    }
}

/// One `data:` payload of the event stream.
///
/// Types this crate does not know deserialize to `Unknown`, so newer servers
/// can add event types without breaking decoding.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    MessageStart {
        message: StartedMessage,
    },
    ContentBlockStart,
    ContentBlockDelta {
        #[serde(default)]
        delta: FrameDelta,
    },
    ContentBlockStop,
    MessageDelta,
    MessageStop,
    Ping,
    Error {
        #[serde(default)]
        error: FrameError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartedMessage {
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameDelta {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

impl FrameError {
    /// Classify a provider error frame
    pub fn kind(&self) -> ErrorKind {
        match self.error_type.as_str() {
            "rate_limit_error" => ErrorKind::RateLimitExceeded,
            "authentication_error" | "permission_error" => ErrorKind::AuthFailure,
            _ => ErrorKind::ServerError,
        }
    }
}

/// Externally visible event produced by the stream decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    MessageStart { id: String },
    ContentDelta { text: String },
    /// Final event carrying the full accumulated text
    MessageStop { text: String },
    Error { cause: ErrorKind },
}

impl StreamEvent {
    pub fn label(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentDelta { .. } => "content_delta",
            StreamEvent::MessageStop { .. } => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Aggregated result of one streaming call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingResult {
    pub accumulated_text: String,
    pub is_complete: bool,
    pub message_id: Option<String>,
    pub error: Option<ErrorKind>,
    /// The stream ended before a stop frame; text is best-effort partial output
    pub truncated: bool,
}

impl StreamingResult {
    /// Completed without error (partial output after a dropped connection counts)
    pub fn is_success(&self) -> bool {
        self.is_complete && self.error.is_none()
    }
}
