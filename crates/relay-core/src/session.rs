use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::{Stream, StreamExt as _};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::abort::{AbortHandle, AbortSignal};
use crate::batcher::{BatchSink, DeltaBatch, DeltaBatcher, Termination};
use crate::config::BatcherConfig;
use crate::encoding::{DeltaEncoding, StoredDelta};
use crate::errors::{RelayError, ReplayError, StoreError};
use crate::event::StreamEvent;
use crate::ids::{SessionId, StreamKey};
use crate::message::{ErrorPayload, LiveStatus, Message, MessageMetadata};
use crate::replay::replay;
use crate::store::{DeltaStore, HistoryStore};

/// Item of a generation's event stream.
pub type EventResult = Result<StreamEvent, crate::errors::GenerationError>;

/// Receiving end of one branch of a teed event stream.
pub struct EventBranch {
    rx: mpsc::UnboundedReceiver<EventResult>,
}

impl EventBranch {
    /// Waits for the next event. Returns `None` once the source ended.
    pub async fn next_event(&mut self) -> Option<EventResult> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = EventResult> + Send {
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }
}

/// Splits `source` into a live branch and a persistence branch.
///
/// The branches are independent: either receiver may be dropped without
/// affecting the other. The source is dropped, which stops generation, once
/// both receivers are gone or `signal` fires.
pub fn tee_events<S>(source: S, signal: AbortSignal) -> (EventBranch, EventBranch)
where
    S: Stream<Item = EventResult> + Send + 'static,
{
    let (live_tx, live_rx) = mpsc::unbounded_channel();
    let (persist_tx, persist_rx) = mpsc::unbounded_channel();
    tokio::spawn(pump(source, live_tx, persist_tx, signal));
    (
        EventBranch { rx: live_rx },
        EventBranch { rx: persist_rx },
    )
}

async fn pump<S>(
    source: S,
    live_tx: mpsc::UnboundedSender<EventResult>,
    persist_tx: mpsc::UnboundedSender<EventResult>,
    mut signal: AbortSignal,
) where
    S: Stream<Item = EventResult> + Send,
{
    let mut source = std::pin::pin!(source);
    let mut live = Some(live_tx);
    let mut persist = Some(persist_tx);
    loop {
        let item = tokio::select! {
            biased;
            _ = signal.aborted() => break,
            item = source.next() => item,
        };
        let Some(item) = item else { break };
        if let Some(tx) = &live
            && tx.send(item.clone()).is_err()
        {
            debug!("live reader detached");
            live = None;
        }
        if let Some(tx) = &persist
            && tx.send(item).is_err()
        {
            debug!("persistence branch closed");
            persist = None;
        }
        if live.is_none() && persist.is_none() {
            break;
        }
    }
}

/// [`BatchSink`] writing batches to a [`DeltaStore`].
///
/// On the terminal outcome it writes the finalized message to history (when
/// configured) and then deletes the session, so readers always find the
/// message in at least one of the two stores.
pub struct StoreSink {
    store: Arc<dyn DeltaStore>,
    history: Option<Arc<dyn HistoryStore>>,
    key: StreamKey,
    session: SessionId,
    encoding: DeltaEncoding,
    seed: Message,
    seen: Mutex<Vec<StreamEvent>>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn DeltaStore>, key: StreamKey, session: SessionId, seed: Message) -> Self {
        Self {
            store,
            history: None,
            key,
            session,
            encoding: DeltaEncoding::default(),
            seed,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Message reconstructed from every batch handed to this sink, with the
    /// status implied by `outcome`.
    fn finalized_message(&self, outcome: &Termination) -> Message {
        let events = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut message = match replay(&events, Some(self.seed.clone())) {
            Ok(message) => message,
            Err(ReplayError::Stream { partial, .. }) => *partial,
            Err(err) => {
                warn!(key = %self.key, error = %err, "replay of finished session failed");
                self.seed.clone()
            }
        };
        let metadata = &mut message.metadata;
        match outcome {
            Termination::Finished => {
                if !message_is_settled(metadata) {
                    metadata.live_status = Some(LiveStatus::Completed);
                }
            }
            Termination::Aborted => metadata.live_status = Some(LiveStatus::Cancelled),
            Termination::Failed(failure) => {
                metadata.live_status = Some(LiveStatus::Error);
                if metadata.error.is_none() {
                    metadata.error = Some(ErrorPayload::new(failure.to_string()));
                }
            }
        }
        message
    }
}

fn message_is_settled(metadata: &MessageMetadata) -> bool {
    metadata.live_status.is_some_and(LiveStatus::is_terminal)
}

#[async_trait::async_trait]
impl BatchSink for StoreSink {
    async fn on_delta(&self, batch: &DeltaBatch) -> Result<(), StoreError> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(batch.events.iter().cloned());
        let stored = StoredDelta::encode(batch, self.encoding)
            .map_err(|e| StoreError::backend(format!("failed to encode delta: {e}")))?;
        self.store.push_delta(self.session, stored).await
    }

    async fn on_terminal(&self, outcome: &Termination) {
        if let Some(history) = &self.history {
            let message = self.finalized_message(outcome);
            if let Err(err) = history.upsert_message(&self.key.thread_id, message).await {
                warn!(key = %self.key, error = %err, "failed to write finalized message to history");
            }
        }
        if let Err(err) = self.store.delete_session(self.session).await {
            warn!(session_id = %self.session, error = %err, "failed to delete stream session");
        }
        info!(session_id = %self.session, key = %self.key, outcome = ?outcome, "stream session closed");
    }
}

/// Entry point wiring a generation stream to live delivery and persistence.
#[derive(Clone)]
pub struct StreamRelay {
    store: Arc<dyn DeltaStore>,
    history: Option<Arc<dyn HistoryStore>>,
    config: BatcherConfig,
}

impl StreamRelay {
    pub fn new(store: Arc<dyn DeltaStore>, config: BatcherConfig) -> Self {
        Self {
            store,
            history: None,
            config,
        }
    }

    /// Writes finalized messages to `history` when a session ends.
    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Opens a session for `key` and starts relaying `source`.
    ///
    /// The returned [`LiveStream`] is the originating client's view; the
    /// persistence branch runs in a background task until the batcher
    /// terminates.
    pub async fn start<S>(&self, key: StreamKey, source: S) -> Result<LiveStream, RelayError>
    where
        S: Stream<Item = EventResult> + Send + 'static,
    {
        let seed = Message::assistant(key.message_id.clone()).with_metadata(
            MessageMetadata::with_status(LiveStatus::Pending).created_at(Utc::now()),
        );
        self.start_with_seed(key, seed, source).await
    }

    /// Like [`StreamRelay::start`], with an explicit placeholder message
    /// (used for `createdAt` and as the replay seed on finalization).
    pub async fn start_with_seed<S>(
        &self,
        key: StreamKey,
        seed: Message,
        source: S,
    ) -> Result<LiveStream, RelayError>
    where
        S: Stream<Item = EventResult> + Send + 'static,
    {
        let session = self.store.create_session(&key).await?;
        info!(session_id = %session, key = %key, "stream session opened");

        let (abort, signal) = AbortHandle::new();
        let (live, persist) = tee_events(source, signal.clone());

        let seed_metadata = seed.metadata.clone();
        let mut sink = StoreSink::new(self.store.clone(), key.clone(), session, seed);
        if let Some(history) = &self.history {
            sink = sink.with_history(history.clone());
        }
        let batcher = Arc::new(DeltaBatcher::new(
            self.config.clone(),
            Arc::new(sink),
            signal,
        ));
        let opening = futures::stream::iter(opening_metadata(&seed_metadata).map(Ok));
        let task = tokio::spawn(batcher.run(opening.chain(persist.into_stream())));

        Ok(LiveStream {
            key,
            session,
            live,
            abort,
            task,
        })
    }
}

/// Leading metadata event for the persisted stream: the seed's `createdAt`
/// and extra fields, without its status, so a resumed message sorts where
/// the finalized one will.
fn opening_metadata(seed: &MessageMetadata) -> Option<StreamEvent> {
    let metadata = MessageMetadata {
        live_status: None,
        ..seed.clone()
    };
    (metadata != MessageMetadata::default()).then(|| StreamEvent::metadata(metadata))
}

/// Originating client's handle on a relayed generation.
pub struct LiveStream {
    key: StreamKey,
    session: SessionId,
    live: EventBranch,
    abort: AbortHandle,
    task: tokio::task::JoinHandle<Termination>,
}

impl LiveStream {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Returns a handle that cancels generation and persistence.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Next live event, delivered without waiting for persistence.
    pub async fn next_event(&mut self) -> Option<EventResult> {
        self.live.next_event().await
    }

    /// Stops reading the live branch and waits for persistence to terminate.
    pub async fn finish(self) -> Result<Termination, RelayError> {
        drop(self.live);
        self.task.await.map_err(|e| {
            RelayError::protocol_msg(format!(
                "persistence task for {} ended without outcome: {e}",
                self.key
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BatchFailure, GenerationError};
    use crate::store::{InMemoryDeltaStore, InMemoryHistoryStore};
    use futures::stream;
    use std::time::Duration;

    fn answer() -> Vec<EventResult> {
        vec![
            Ok(StreamEvent::start("m1")),
            Ok(StreamEvent::TextStart { id: "t".into() }),
            Ok(StreamEvent::text_delta("t", "Hello")),
            Ok(StreamEvent::text_delta("t", " there")),
            Ok(StreamEvent::TextEnd { id: "t".into() }),
            Ok(StreamEvent::finish()),
        ]
    }

    #[tokio::test]
    async fn tee_delivers_every_event_to_both_branches() {
        let (mut live, mut persist) =
            tee_events(stream::iter(answer()), AbortSignal::never());
        let mut live_events = Vec::new();
        while let Some(item) = live.next_event().await {
            live_events.push(item);
        }
        let mut persisted = Vec::new();
        while let Some(item) = persist.next_event().await {
            persisted.push(item);
        }
        assert_eq!(live_events, answer());
        assert_eq!(persisted, answer());
    }

    #[tokio::test]
    async fn dropped_live_branch_does_not_stop_persistence() {
        let (live, persist) = tee_events(stream::iter(answer()), AbortSignal::never());
        drop(live);
        let persisted: Vec<_> = persist.into_stream().collect().await;
        assert_eq!(persisted.len(), answer().len());
    }

    #[tokio::test]
    async fn relayed_session_is_finalized_into_history() {
        let store = Arc::new(InMemoryDeltaStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let relay = StreamRelay::new(store.clone(), BatcherConfig::new(Duration::ZERO))
            .with_history(history.clone());
        let key = StreamKey::new("thread", "m1");

        let mut live = relay.start(key.clone(), stream::iter(answer())).await.unwrap();
        let mut text = String::new();
        while let Some(Ok(event)) = live.next_event().await {
            if let Some(delta) = event.delta_text() {
                text.push_str(delta);
            }
        }
        assert_eq!(text, "Hello there");
        assert_eq!(live.finish().await.unwrap(), Termination::Finished);

        assert_eq!(store.find_session(&key).await.unwrap(), None);
        let stored = history
            .get_message(&key.thread_id, &key.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.text(), "Hello there");
        assert_eq!(stored.live_status(), LiveStatus::Completed);
        assert!(stored.created_at().is_some());
    }

    #[tokio::test]
    async fn upstream_failure_is_recorded_as_error_status() {
        let store = Arc::new(InMemoryDeltaStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let relay = StreamRelay::new(store.clone(), BatcherConfig::new(Duration::ZERO))
            .with_history(history.clone());
        let key = StreamKey::new("thread", "m1");
        let source = stream::iter(vec![
            Ok(StreamEvent::start("m1")),
            Ok(StreamEvent::text_delta("t", "partial")),
            Err(GenerationError::provider("overloaded")),
        ]);

        let live = relay.start(key.clone(), source).await.unwrap();
        let outcome = live.finish().await.unwrap();
        assert!(matches!(outcome, Termination::Failed(BatchFailure::Generation(_))));

        let stored = history
            .get_message(&key.thread_id, &key.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.live_status(), LiveStatus::Error);
        assert_eq!(stored.text(), "partial");
        assert_eq!(
            stored.metadata.error.map(|e| e.message),
            Some("provider failure: overloaded".to_string())
        );
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn in_flight_resume_carries_the_seed_creation_time() {
        let store = Arc::new(InMemoryDeltaStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let relay = StreamRelay::new(store.clone(), BatcherConfig::new(Duration::ZERO));
        let key = StreamKey::new("thread", "m1");
        let created = chrono::DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let seed = Message::assistant("m1")
            .with_metadata(MessageMetadata::with_status(LiveStatus::Pending).created_at(created));
        let source = stream::iter(vec![
            Ok(StreamEvent::start("m1")),
            Ok(StreamEvent::text_delta("t", "a")),
        ])
        .chain(stream::pending());

        let mut live = relay.start_with_seed(key.clone(), seed, source).await.unwrap();
        assert!(matches!(live.next_event().await, Some(Ok(StreamEvent::Start { .. }))));
        assert!(matches!(live.next_event().await, Some(Ok(StreamEvent::TextDelta { .. }))));
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let reader = crate::resume::ResumeReader::new(store.clone(), history);
        let message = match reader.read(&key).await.unwrap() {
            crate::resume::ResumeOutcome::InFlight(message) => message,
            other => panic!("expected in-flight message, got {other:?}"),
        };
        assert_eq!(message.created_at(), Some(created));
        assert_eq!(message.live_status(), LiveStatus::Streaming);
        assert_eq!(message.text(), "a");

        live.abort_handle().abort();
        assert_eq!(live.finish().await.unwrap(), Termination::Aborted);
    }

    #[test]
    fn opening_metadata_drops_status_and_skips_empty_seeds() {
        assert_eq!(opening_metadata(&MessageMetadata::with_status(LiveStatus::Pending)), None);
        let created = Utc::now();
        let seed = MessageMetadata::with_status(LiveStatus::Pending).created_at(created);
        assert_eq!(
            opening_metadata(&seed),
            Some(StreamEvent::metadata(MessageMetadata::default().created_at(created)))
        );
    }

    #[tokio::test]
    async fn abort_handle_cancels_session() {
        let store = Arc::new(InMemoryDeltaStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let relay = StreamRelay::new(store.clone(), BatcherConfig::new(Duration::ZERO))
            .with_history(history.clone());
        let key = StreamKey::new("thread", "m1");
        let source = stream::iter(vec![
            Ok(StreamEvent::start("m1")),
            Ok(StreamEvent::text_delta("t", "Hel")),
        ])
        .chain(stream::pending());

        let mut live = relay.start(key.clone(), source).await.unwrap();
        assert!(matches!(live.next_event().await, Some(Ok(StreamEvent::Start { .. }))));
        assert!(matches!(live.next_event().await, Some(Ok(StreamEvent::TextDelta { .. }))));
        live.abort_handle().abort();

        assert_eq!(live.finish().await.unwrap(), Termination::Aborted);
        let stored = history
            .get_message(&key.thread_id, &key.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.live_status(), LiveStatus::Cancelled);
        assert_eq!(store.session_count(), 0);
    }
}
