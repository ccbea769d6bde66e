use crate::ids::{MessageId, SessionId};
use crate::message::Message;

/// Failure of the upstream generation process, surfaced through the event
/// stream feeding the batcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The model provider returned a failure.
    #[error("provider failure: {message}")]
    Provider { message: String },
    /// The event source broke off mid-stream.
    #[error("stream interrupted: {message}")]
    Interrupted { message: String },
}

impl GenerationError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::Interrupted {
            message: message.into(),
        }
    }
}

/// Errors returned by a delta or history store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    /// Pushed delta does not continue the session's cursor.
    #[error("non-contiguous delta for session {session}: expected start {expected}, got {found}")]
    NonContiguous {
        session: SessionId,
        expected: usize,
        found: usize,
    },
    /// Backend I/O failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// Cause of a batcher's `Failed` outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchFailure {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    /// Persisting a flushed batch failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors decoding stored delta payloads.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("invalid inline+json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while reconstructing a message from events.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    /// Events from two different messages were mixed. Always a caller bug.
    #[error("cross-message contamination: expected message {expected}, found {found}")]
    CrossMessageContamination {
        expected: MessageId,
        found: MessageId,
    },
    /// The event sequence contained an `error` event.
    #[error("stream error: {message}")]
    Stream {
        message: String,
        /// Message reconstructed up to the error event.
        partial: Box<Message>,
    },
    /// A tool result referenced a tool call that never started.
    #[error("tool result for unknown tool call {tool_call_id}")]
    UnknownToolCall { tool_call_id: String },
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Top-level error type for the relay API.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<BatchFailure> for RelayError {
    fn from(value: BatchFailure) -> Self {
        match value {
            BatchFailure::Generation(err) => Self::Generation(err),
            BatchFailure::Store(err) => Self::Store(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contamination_message_names_both_ids() {
        let err = ReplayError::CrossMessageContamination {
            expected: MessageId::new("a"),
            found: MessageId::new("b"),
        };
        assert_eq!(
            err.to_string(),
            "cross-message contamination: expected message a, found b"
        );
    }

    #[test]
    fn store_error_converts_into_relay_error() {
        let err: RelayError = StoreError::backend("disk full").into();
        assert!(matches!(err, RelayError::Store(StoreError::Backend(msg)) if msg == "disk full"));
    }
}
