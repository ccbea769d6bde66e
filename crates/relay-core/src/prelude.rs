//! Common imports for producing and resuming relayed streams.
pub use crate::{
    AbortHandle, BatcherConfig, DeltaStore, HistoryStore, InMemoryDeltaStore,
    InMemoryHistoryStore, LiveStatus, LiveStream, Message, MessageId, RelayError, ResumeOutcome,
    ResumeReader, StreamEvent, StreamKey, StreamRelay, Termination, ThreadId,
};
