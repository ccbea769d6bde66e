//! Producer-side half of a streaming delta relay.
//!
//! A generation's event stream is teed into a live branch for the client that
//! started it and a persistence branch feeding a [`DeltaBatcher`], which
//! compresses, throttles and persists contiguous delta batches. Any other
//! reader reconstructs the in-flight message from those batches with
//! [`ResumeReader`], or finds the finalized message in history once the
//! session closed.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::stream;
//! use relay_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), RelayError> {
//! let store = Arc::new(InMemoryDeltaStore::new());
//! let history = Arc::new(InMemoryHistoryStore::new());
//! let relay = StreamRelay::new(store.clone(), BatcherConfig::from_env()?)
//!     .with_history(history.clone());
//!
//! let key = StreamKey::new("thread-1", "msg-1");
//! let source = stream::iter(vec![
//!     Ok(StreamEvent::start("msg-1")),
//!     Ok(StreamEvent::text_delta("t0", "Hello")),
//!     Ok(StreamEvent::finish()),
//! ]);
//! let mut live = relay.start(key.clone(), source).await?;
//! while let Some(event) = live.next_event().await {
//!     println!("{:?}", event?);
//! }
//! live.finish().await?;
//!
//! let reader = ResumeReader::new(store, history);
//! println!("{:?}", reader.read(&key).await?);
//! # Ok(())
//! # }
//! ```

/// Cancellation handle and signal shared across a session's tasks.
pub mod abort;
/// Delta batcher, batch sink contract and termination outcomes.
pub mod batcher;
/// Chunk compressor merging adjacent incremental events.
pub mod compress;
/// Batcher configuration.
pub mod config;
/// Stored delta payload encodings.
pub mod encoding;
/// Error types for every layer of the relay.
pub mod errors;
/// Wire-level stream events.
pub mod event;
/// Thread, message, session and stream identifiers.
pub mod ids;
/// Single-slot flush lane.
pub mod lane;
/// Reconstructed messages and their metadata.
pub mod message;
/// Process-wide tracing setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Message replayer.
pub mod replay;
/// Resume read path and replay cache.
pub mod resume;
/// Live/persistence tee and stream session wiring.
pub mod session;
/// Delta and history store contracts with in-memory implementations.
pub mod store;

pub use abort::{AbortHandle, AbortSignal};
pub use batcher::{BatchSink, DeltaBatch, DeltaBatcher, Termination};
pub use compress::compress;
pub use config::BatcherConfig;
pub use encoding::{DeltaEncoding, StoredDelta};
pub use errors::{
    BatchFailure, ConfigError, EncodingError, GenerationError, RelayError, ReplayError, StoreError,
};
pub use event::StreamEvent;
pub use ids::{MessageId, SessionId, StreamKey, ThreadId};
pub use lane::FlushLane;
pub use message::{ErrorPayload, LiveStatus, Message, MessageMetadata, MessagePart, Role};
pub use observability::init_observability;
pub use replay::replay;
pub use resume::{ReplayCache, ResumeOutcome, ResumeReader};
pub use session::{EventBranch, EventResult, LiveStream, StoreSink, StreamRelay, tee_events};
pub use store::{DeltaStore, HistoryStore, InMemoryDeltaStore, InMemoryHistoryStore};
