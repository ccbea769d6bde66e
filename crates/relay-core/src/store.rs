//! Storage contracts for delta sessions and finalized history, plus in-memory
//! implementations.

use dashmap::DashMap;
use tracing::debug;

use crate::encoding::StoredDelta;
use crate::errors::StoreError;
use crate::ids::{MessageId, SessionId, StreamKey, ThreadId};
use crate::message::Message;

/// Durable, append-only storage of delta batches per stream session.
#[async_trait::async_trait]
pub trait DeltaStore: Send + Sync {
    /// Opens a session for `key`. A session already open for the same key is
    /// replaced.
    async fn create_session(&self, key: &StreamKey) -> Result<SessionId, StoreError>;

    /// Appends one delta. Deltas must be contiguous within the session.
    async fn push_delta(&self, session: SessionId, delta: StoredDelta) -> Result<(), StoreError>;

    /// Deletes the session and all of its deltas.
    async fn delete_session(&self, session: SessionId) -> Result<(), StoreError>;

    /// Returns the open session for `key`, if any.
    async fn find_session(&self, key: &StreamKey) -> Result<Option<SessionId>, StoreError>;

    /// Returns the session's deltas in `start` order, or `None` when the
    /// session no longer exists.
    async fn read_deltas(&self, session: SessionId)
    -> Result<Option<Vec<StoredDelta>>, StoreError>;
}

/// Persisted history of finalized messages.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Inserts the message or replaces the one with the same id.
    async fn upsert_message(&self, thread: &ThreadId, message: Message) -> Result<(), StoreError>;

    /// All messages of a thread ordered by `createdAt` ascending.
    async fn list_messages(&self, thread: &ThreadId) -> Result<Vec<Message>, StoreError>;

    async fn get_message(
        &self,
        thread: &ThreadId,
        id: &MessageId,
    ) -> Result<Option<Message>, StoreError>;
}

struct SessionRecord {
    key: StreamKey,
    deltas: Vec<StoredDelta>,
}

/// In-memory [`DeltaStore`].
#[derive(Default)]
pub struct InMemoryDeltaStore {
    sessions: DashMap<SessionId, SessionRecord>,
    by_key: DashMap<StreamKey, SessionId>,
}

impl InMemoryDeltaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait::async_trait]
impl DeltaStore for InMemoryDeltaStore {
    async fn create_session(&self, key: &StreamKey) -> Result<SessionId, StoreError> {
        let session = SessionId::generate();
        if let Some(previous) = self.by_key.insert(key.clone(), session) {
            self.sessions.remove(&previous);
            debug!(session_id = %previous, key = %key, "replaced open stream session");
        }
        self.sessions.insert(
            session,
            SessionRecord {
                key: key.clone(),
                deltas: Vec::new(),
            },
        );
        Ok(session)
    }

    async fn push_delta(&self, session: SessionId, delta: StoredDelta) -> Result<(), StoreError> {
        let mut record = self
            .sessions
            .get_mut(&session)
            .ok_or(StoreError::SessionNotFound(session))?;
        let expected = record.deltas.last().map_or(0, |last| last.end);
        if delta.start != expected {
            return Err(StoreError::NonContiguous {
                session,
                expected,
                found: delta.start,
            });
        }
        record.deltas.push(delta);
        Ok(())
    }

    async fn delete_session(&self, session: SessionId) -> Result<(), StoreError> {
        if let Some((_, record)) = self.sessions.remove(&session) {
            self.by_key.remove_if(&record.key, |_, current| *current == session);
        }
        Ok(())
    }

    async fn find_session(&self, key: &StreamKey) -> Result<Option<SessionId>, StoreError> {
        Ok(self.by_key.get(key).map(|entry| *entry.value()))
    }

    async fn read_deltas(
        &self,
        session: SessionId,
    ) -> Result<Option<Vec<StoredDelta>>, StoreError> {
        Ok(self
            .sessions
            .get(&session)
            .map(|record| record.deltas.clone()))
    }
}

/// In-memory [`HistoryStore`].
#[derive(Default)]
pub struct InMemoryHistoryStore {
    threads: DashMap<ThreadId, Vec<Message>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn upsert_message(&self, thread: &ThreadId, message: Message) -> Result<(), StoreError> {
        let mut messages = self.threads.entry(thread.clone()).or_default();
        match messages.iter_mut().find(|existing| existing.id == message.id) {
            Some(existing) => *existing = message,
            None => messages.push(message),
        }
        Ok(())
    }

    async fn list_messages(&self, thread: &ThreadId) -> Result<Vec<Message>, StoreError> {
        let mut messages = self
            .threads
            .get(thread)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        messages.sort_by_key(Message::created_at);
        Ok(messages)
    }

    async fn get_message(
        &self,
        thread: &ThreadId,
        id: &MessageId,
    ) -> Result<Option<Message>, StoreError> {
        Ok(self
            .threads
            .get(thread)
            .and_then(|entry| entry.iter().find(|message| message.id == *id).cloned()))
    }
}
