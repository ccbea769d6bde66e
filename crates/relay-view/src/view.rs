use std::sync::{Mutex, MutexGuard, PoisonError};

use relay_core::{
    HistoryStore, Message, MessageId, RelayError, ResumeOutcome, ResumeReader, StreamKey, ThreadId,
};
use tracing::debug;

use crate::merge::MessageMerge;
use crate::throttle::{RenderThrottle, SubscriptionId, ThrottleConfig};

/// A reader's view of one thread: the merged message list behind a render
/// throttle.
pub struct ReaderView {
    merge: Mutex<MessageMerge>,
    throttle: RenderThrottle<Vec<Message>>,
}

impl ReaderView {
    /// Empty view delivering at most as often as `config` allows.
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            merge: Mutex::new(MessageMerge::new()),
            throttle: RenderThrottle::new(Vec::new(), config),
        }
    }

    fn merge(&self) -> MutexGuard<'_, MessageMerge> {
        self.merge.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` to the merge and publishes the result through the
    /// throttle.
    fn publish(&self, change: impl FnOnce(&mut MessageMerge)) {
        let merged = {
            let mut merge = self.merge();
            change(&mut merge);
            merge.merged().to_vec()
        };
        self.throttle.set(merged);
    }

    /// Replaces the persisted history tier.
    pub fn set_history(&self, messages: Vec<Message>) {
        self.publish(|merge| merge.set_history(messages));
    }

    /// Replaces the local stream's messages.
    pub fn set_live(&self, messages: Vec<Message>) {
        self.publish(|merge| merge.set_live(messages));
    }

    /// Records the local stream's latest reconstruction of `message`.
    pub fn upsert_live(&self, message: Message) {
        self.publish(|merge| merge.upsert_live(message));
    }

    /// Drops a local stream message, e.g. once it reached history.
    pub fn remove_live(&self, id: &MessageId) {
        self.publish(|merge| {
            merge.remove_live(id);
        });
    }

    /// Applies a resume result: in-flight messages go to the resumed tier,
    /// finalized ones move into history.
    pub fn apply_resume(&self, id: &MessageId, outcome: ResumeOutcome) {
        self.publish(|merge| match outcome {
            ResumeOutcome::InFlight(message) => merge.upsert_resumed(message),
            ResumeOutcome::Finalized(message) => {
                merge.remove_resumed(id);
                if let Some(message) = message {
                    merge.upsert_history(message);
                }
            }
        });
    }

    /// Loads the thread's persisted history into the base tier.
    pub async fn load_history(
        &self,
        history: &dyn HistoryStore,
        thread: &ThreadId,
    ) -> Result<(), RelayError> {
        let messages = history.list_messages(thread).await?;
        debug!(thread_id = %thread, count = messages.len(), "loaded history");
        self.set_history(messages);
        Ok(())
    }

    /// Reads the current state of `key` and applies it. Returns true once
    /// the stream is finalized.
    pub async fn poll(&self, reader: &ResumeReader, key: &StreamKey) -> Result<bool, RelayError> {
        let outcome = reader.read(key).await?;
        let finalized = matches!(outcome, ResumeOutcome::Finalized(_));
        self.apply_resume(&key.message_id, outcome);
        Ok(finalized)
    }

    /// Republishes the merged list immediately, e.g. after the view was
    /// hidden and updates were skipped.
    pub fn resume(&self) {
        let merged = self.merge().merged().to_vec();
        self.throttle.set_instant(merged);
    }

    /// Last delivered message list.
    pub fn current(&self) -> Vec<Message> {
        self.throttle.current()
    }

    /// Most recent merged list, delivered or not.
    pub fn latest(&self) -> Vec<Message> {
        self.throttle.latest()
    }

    /// Registers a renderer called with every delivered list.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Vec<Message>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.throttle.subscribe(callback)
    }

    /// Removes a renderer. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.throttle.unsubscribe(id)
    }

    /// Stops all further deliveries.
    pub fn dispose(&self) {
        self.throttle.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use futures::StreamExt as _;
    use relay_core::{
        BatcherConfig, InMemoryDeltaStore, InMemoryHistoryStore, LiveStatus, MessageMetadata,
        StreamEvent, StreamRelay,
    };

    fn msg(id: &str, secs: i64) -> Message {
        let created = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
        Message::assistant(id)
            .with_metadata(MessageMetadata::with_status(LiveStatus::Completed).created_at(created))
    }

    fn ids(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.id.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn tier_updates_flow_through_throttle() {
        let view = ReaderView::new(&ThrottleConfig::default().max_fps(10.0));
        view.set_history(vec![msg("A", 1), msg("B", 3)]);
        assert_eq!(ids(&view.current()), vec!["A", "B"]);

        view.upsert_live(msg("C", 2));
        assert_eq!(ids(&view.current()), vec!["A", "B"]);
        assert_eq!(ids(&view.latest()), vec!["A", "C", "B"]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ids(&view.current()), vec!["A", "C", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_publishes_immediately() {
        let view = ReaderView::new(&ThrottleConfig::default().max_fps(1.0));
        view.set_history(vec![msg("A", 1)]);
        view.upsert_live(msg("B", 2));
        assert_eq!(view.current().len(), 1);

        view.resume();
        assert_eq!(ids(&view.current()), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn finalized_resume_moves_message_into_history() {
        let view = ReaderView::new(&ThrottleConfig::unthrottled());
        let id = MessageId::new("m");
        let mut streaming = msg("m", 5);
        streaming.metadata.live_status = Some(LiveStatus::Streaming);

        view.apply_resume(&id, ResumeOutcome::InFlight(streaming));
        assert_eq!(view.current()[0].live_status(), LiveStatus::Streaming);

        view.apply_resume(&id, ResumeOutcome::Finalized(Some(msg("m", 5))));
        let current = view.current();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].live_status(), LiveStatus::Completed);
    }

    #[tokio::test]
    async fn polls_relayed_stream_and_loads_history() {
        let store = Arc::new(InMemoryDeltaStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let thread = ThreadId::new("thread");
        history
            .upsert_message(&thread, Message::user_text("q", "hi"))
            .await
            .unwrap();

        let relay = StreamRelay::new(store.clone(), BatcherConfig::new(Duration::ZERO))
            .with_history(history.clone());
        let key = StreamKey::new("thread", "a");
        let source = futures::stream::iter(vec![
            Ok(StreamEvent::start("a")),
            Ok(StreamEvent::text_delta("t", "hello")),
            Ok(StreamEvent::finish()),
        ]);
        relay.start(key.clone(), source).await.unwrap().finish().await.unwrap();

        let view = ReaderView::new(&ThrottleConfig::unthrottled());
        view.load_history(history.as_ref(), &thread).await.unwrap();
        let reader = ResumeReader::new(store, history);
        assert!(view.poll(&reader, &key).await.unwrap());

        let current = view.current();
        assert_eq!(ids(&current), vec!["q", "a"]);
        assert_eq!(current[1].text(), "hello");
    }

    #[tokio::test]
    async fn in_flight_answer_sorts_after_the_question_it_answers() {
        let store = Arc::new(InMemoryDeltaStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let thread = ThreadId::new("thread");
        history.upsert_message(&thread, msg("q", 1)).await.unwrap();

        let relay = StreamRelay::new(store.clone(), BatcherConfig::new(Duration::ZERO));
        let key = StreamKey::new("thread", "a");
        let source = futures::stream::iter(vec![
            Ok(StreamEvent::start("a")),
            Ok(StreamEvent::text_delta("t", "a")),
        ])
        .chain(futures::stream::pending());
        let mut live = relay.start(key.clone(), source).await.unwrap();
        while let Some(Ok(event)) = live.next_event().await {
            if event.delta_text().is_some() {
                break;
            }
        }
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let view = ReaderView::new(&ThrottleConfig::unthrottled());
        view.load_history(history.as_ref(), &thread).await.unwrap();
        let reader = ResumeReader::new(store, history);
        assert!(!view.poll(&reader, &key).await.unwrap());

        let current = view.current();
        assert_eq!(ids(&current), vec!["q", "a"]);
        assert!(current[1].created_at() > current[0].created_at());
        assert_eq!(current[1].live_status(), LiveStatus::Streaming);

        live.abort_handle().abort();
        live.finish().await.unwrap();
    }

    #[tokio::test]
    async fn disposed_view_stops_publishing() {
        let view = ReaderView::new(&ThrottleConfig::unthrottled());
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        view.subscribe(move |_| *counter.lock().unwrap() += 1);

        view.set_history(vec![msg("A", 1)]);
        view.dispose();
        view.set_history(vec![msg("B", 2)]);

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(ids(&view.current()), vec!["A"]);
    }
}
