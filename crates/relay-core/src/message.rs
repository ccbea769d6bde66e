use chrono::{DateTime, Utc};

use crate::ids::MessageId;

/// Author of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
}

/// Generation status tracked in message metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveStatus {
    Pending,
    Streaming,
    Completed,
    Error,
    Cancelled,
}

impl LiveStatus {
    /// Returns true once no further events are expected for the message.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// Typed error attached to a message whose generation failed.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    /// Whether the reader may offer a retry affordance.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Message metadata. Also used as the patch carried by metadata events: every
/// field present in a patch overwrites the current value.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_status: Option<LiveStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageMetadata {
    pub fn with_status(status: LiveStatus) -> Self {
        Self {
            live_status: Some(status),
            ..Self::default()
        }
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Applies `patch` on top of `self`.
    pub fn merge(&mut self, patch: &MessageMetadata) {
        if let Some(status) = patch.live_status {
            self.live_status = Some(status);
        }
        if let Some(created_at) = patch.created_at {
            self.created_at = Some(created_at);
        }
        if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
        for (key, value) in &patch.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

/// Streaming state of a text or reasoning part.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartState {
    Streaming,
    Done,
}

/// Lifecycle of a tool part.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    InputAvailable,
    OutputAvailable,
}

/// One renderable part of a message, in production order.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    StepStart,
    Text {
        text: String,
        state: PartState,
    },
    Reasoning {
        text: String,
        state: PartState,
    },
    #[serde(rename_all = "camelCase")]
    Tool {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        state: ToolState,
    },
}

/// The unit shown to a reader.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// Creates an empty assistant message.
    pub fn assistant(id: impl Into<MessageId>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            parts: Vec::new(),
            metadata: MessageMetadata::default(),
        }
    }

    /// Creates a user message with a single finished text part.
    pub fn user_text(id: impl Into<MessageId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            parts: vec![MessagePart::Text {
                text: text.into(),
                state: PartState::Done,
            }],
            metadata: MessageMetadata::with_status(LiveStatus::Completed),
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.created_at
    }

    /// Missing status reads as pending.
    pub fn live_status(&self) -> LiveStatus {
        self.metadata.live_status.unwrap_or(LiveStatus::Pending)
    }

    /// Concatenates all text parts in order and ignores other parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text, .. } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// Concatenated reasoning text.
    pub fn reasoning(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Reasoning { text, .. } = part {
                out.push_str(text);
            }
        }
        out
    }
}
