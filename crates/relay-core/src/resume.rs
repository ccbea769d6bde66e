//! Reader-side reconstruction of an in-flight message from its stored deltas.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::encoding::collect_events;
use crate::errors::{RelayError, ReplayError};
use crate::event::StreamEvent;
use crate::ids::{MessageId, StreamKey};
use crate::message::{LiveStatus, Message, MessageMetadata};
use crate::replay::replay;
use crate::store::{DeltaStore, HistoryStore};

/// Result of resuming a stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ResumeOutcome {
    /// A session is still open; the message is reconstructed from its deltas.
    InFlight(Message),
    /// No session is open; the message, if any, comes from history.
    Finalized(Option<Message>),
}

impl ResumeOutcome {
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::InFlight(message) => Some(message),
            Self::Finalized(message) => message.as_ref(),
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::InFlight(message) => Some(message),
            Self::Finalized(message) => message,
        }
    }
}

/// Replay results per message, reused while the event count is unchanged.
#[derive(Default)]
pub struct ReplayCache {
    entries: DashMap<MessageId, (usize, Message)>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached message for `id` when it was built from the same
    /// number of events, otherwise replays and caches the result.
    pub fn get_or_replay(
        &self,
        id: &MessageId,
        events: &[StreamEvent],
    ) -> Result<Message, ReplayError> {
        if let Some(entry) = self.entries.get(id)
            && entry.0 == events.len()
        {
            return Ok(entry.1.clone());
        }
        let message = replay(events, Some(Message::assistant(id.clone())))?;
        self.entries
            .insert(id.clone(), (events.len(), message.clone()));
        Ok(message)
    }

    pub fn invalidate(&self, id: &MessageId) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads a stream's current state for a reader that did not start it.
pub struct ResumeReader {
    store: Arc<dyn DeltaStore>,
    history: Arc<dyn HistoryStore>,
    cache: ReplayCache,
}

impl ResumeReader {
    pub fn new(store: Arc<dyn DeltaStore>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            history,
            cache: ReplayCache::new(),
        }
    }

    pub fn cache(&self) -> &ReplayCache {
        &self.cache
    }

    /// Resolves `key` to an in-flight reconstruction or the finalized
    /// history entry.
    ///
    /// A session deleted between lookup and read counts as finalized. An
    /// undecodable session degrades to a pending placeholder. A stream that
    /// ended in an `error` event yields its partial message.
    pub async fn read(&self, key: &StreamKey) -> Result<ResumeOutcome, RelayError> {
        let Some(session) = self.store.find_session(key).await? else {
            self.cache.invalidate(&key.message_id);
            return self.finalized(key).await;
        };
        let Some(deltas) = self.store.read_deltas(session).await? else {
            debug!(session_id = %session, key = %key, "session closed during resume");
            self.cache.invalidate(&key.message_id);
            return self.finalized(key).await;
        };

        let events = match collect_events(deltas) {
            Ok(events) => events,
            Err(err) => {
                warn!(session_id = %session, key = %key, error = %err, "failed to decode stored deltas");
                return Ok(ResumeOutcome::InFlight(pending(&key.message_id)));
            }
        };
        match self.cache.get_or_replay(&key.message_id, &events) {
            Ok(message) => Ok(ResumeOutcome::InFlight(message)),
            Err(ReplayError::Stream { partial, .. }) => Ok(ResumeOutcome::InFlight(*partial)),
            Err(err) => Err(err.into()),
        }
    }

    async fn finalized(&self, key: &StreamKey) -> Result<ResumeOutcome, RelayError> {
        let message = self
            .history
            .get_message(&key.thread_id, &key.message_id)
            .await?;
        Ok(ResumeOutcome::Finalized(message))
    }
}

fn pending(id: &MessageId) -> Message {
    Message::assistant(id.clone()).with_metadata(MessageMetadata::with_status(LiveStatus::Pending))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::DeltaBatch;
    use crate::encoding::{DeltaEncoding, StoredDelta};
    use crate::store::{InMemoryDeltaStore, InMemoryHistoryStore};

    struct Fixture {
        store: Arc<InMemoryDeltaStore>,
        history: Arc<InMemoryHistoryStore>,
        reader: ResumeReader,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryDeltaStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let reader = ResumeReader::new(store.clone(), history.clone());
        Fixture {
            store,
            history,
            reader,
        }
    }

    fn delta(start: usize, events: Vec<StreamEvent>) -> StoredDelta {
        let batch = DeltaBatch {
            start,
            end: start + events.len(),
            events,
        };
        StoredDelta::encode(&batch, DeltaEncoding::InlineJson).unwrap()
    }

    #[tokio::test]
    async fn open_session_is_replayed() {
        let f = fixture();
        let key = StreamKey::new("t", "m1");
        let session = f.store.create_session(&key).await.unwrap();
        f.store
            .push_delta(session, delta(0, vec![StreamEvent::start("m1")]))
            .await
            .unwrap();
        f.store
            .push_delta(session, delta(1, vec![StreamEvent::text_delta("x", "Hi")]))
            .await
            .unwrap();

        let outcome = f.reader.read(&key).await.unwrap();
        let message = match outcome {
            ResumeOutcome::InFlight(message) => message,
            other => panic!("expected in-flight outcome, got {other:?}"),
        };
        assert_eq!(message.text(), "Hi");
        assert_eq!(message.live_status(), LiveStatus::Streaming);
        assert_eq!(f.reader.cache().len(), 1);
    }

    #[tokio::test]
    async fn missing_session_falls_back_to_history() {
        let f = fixture();
        let key = StreamKey::new("t", "m1");
        assert_eq!(
            f.reader.read(&key).await.unwrap(),
            ResumeOutcome::Finalized(None)
        );

        let done = Message::assistant("m1")
            .with_metadata(MessageMetadata::with_status(LiveStatus::Completed));
        f.history
            .upsert_message(&key.thread_id, done.clone())
            .await
            .unwrap();
        assert_eq!(
            f.reader.read(&key).await.unwrap(),
            ResumeOutcome::Finalized(Some(done))
        );
    }

    #[tokio::test]
    async fn errored_stream_resumes_as_partial_message() {
        let f = fixture();
        let key = StreamKey::new("t", "m1");
        let session = f.store.create_session(&key).await.unwrap();
        f.store
            .push_delta(
                session,
                delta(
                    0,
                    vec![
                        StreamEvent::start("m1"),
                        StreamEvent::text_delta("x", "so far"),
                        StreamEvent::error("boom"),
                    ],
                ),
            )
            .await
            .unwrap();

        let message = f.reader.read(&key).await.unwrap().into_message().unwrap();
        assert_eq!(message.text(), "so far");
        assert_eq!(message.live_status(), LiveStatus::Error);
    }

    #[tokio::test]
    async fn contamination_is_raised() {
        let f = fixture();
        let key = StreamKey::new("t", "m1");
        let session = f.store.create_session(&key).await.unwrap();
        f.store
            .push_delta(session, delta(0, vec![StreamEvent::start("other")]))
            .await
            .unwrap();

        let err = f.reader.read(&key).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Replay(ReplayError::CrossMessageContamination { .. })
        ));
    }

    #[tokio::test]
    async fn corrupt_payload_degrades_to_pending() {
        let f = fixture();
        let key = StreamKey::new("t", "m1");
        let session = f.store.create_session(&key).await.unwrap();
        f.store
            .push_delta(
                session,
                StoredDelta {
                    start: 0,
                    end: 1,
                    encoding: DeltaEncoding::InlineJson,
                    payload: "not json".into(),
                },
            )
            .await
            .unwrap();

        let message = f.reader.read(&key).await.unwrap().into_message().unwrap();
        assert_eq!(message.live_status(), LiveStatus::Pending);
        assert!(message.parts.is_empty());
    }

    #[test]
    fn cache_reuses_result_while_event_count_is_unchanged() {
        let cache = ReplayCache::new();
        let id = MessageId::new("m");
        let first = vec![StreamEvent::start("m"), StreamEvent::text_delta("x", "a")];
        assert_eq!(cache.get_or_replay(&id, &first).unwrap().text(), "a");

        // Same length, different content: served from the cache.
        let same_len = vec![StreamEvent::start("m"), StreamEvent::text_delta("x", "b")];
        assert_eq!(cache.get_or_replay(&id, &same_len).unwrap().text(), "a");

        let longer = vec![
            StreamEvent::start("m"),
            StreamEvent::text_delta("x", "a"),
            StreamEvent::text_delta("x", "c"),
        ];
        assert_eq!(cache.get_or_replay(&id, &longer).unwrap().text(), "ac");

        cache.invalidate(&id);
        assert!(cache.is_empty());
    }
}
