use crate::ids::MessageId;
use crate::message::MessageMetadata;

/// Typed unit of incremental generation progress.
///
/// Events are produced by the generation process, never mutated, and totally
/// ordered within one message.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Opens a message. The only event carrying the message id.
    #[serde(rename_all = "camelCase")]
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<MessageMetadata>,
    },
    StartStep,
    FinishStep,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        output: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Metadata { message_metadata: MessageMetadata },
    #[serde(rename_all = "camelCase")]
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<MessageMetadata>,
    },
    #[serde(rename_all = "camelCase")]
    Error { error_text: String },
    Abort,
}

impl StreamEvent {
    pub fn start(message_id: impl Into<MessageId>) -> Self {
        Self::Start {
            message_id: Some(message_id.into()),
            message_metadata: None,
        }
    }

    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn reasoning_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::ReasoningDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn metadata(metadata: MessageMetadata) -> Self {
        Self::Metadata {
            message_metadata: metadata,
        }
    }

    pub fn finish() -> Self {
        Self::Finish {
            message_metadata: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error {
            error_text: text.into(),
        }
    }

    /// Message id carried by this event, if any.
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Start { message_id, .. } => message_id.as_ref(),
            _ => None,
        }
    }

    /// Returns true for text and reasoning deltas, the only events the
    /// compressor merges and the boundary matcher inspects.
    pub fn is_incremental(&self) -> bool {
        matches!(self, Self::TextDelta { .. } | Self::ReasoningDelta { .. })
    }

    /// Content of an incremental delta.
    pub fn delta_text(&self) -> Option<&str> {
        match self {
            Self::TextDelta { delta, .. } | Self::ReasoningDelta { delta, .. } => Some(delta),
            _ => None,
        }
    }

    /// Kebab-case type tag, as used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::StartStep => "start-step",
            Self::FinishStep => "finish-step",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Metadata { .. } => "metadata",
            Self::Finish { .. } => "finish",
            Self::Error { .. } => "error",
            Self::Abort => "abort",
        }
    }
}
