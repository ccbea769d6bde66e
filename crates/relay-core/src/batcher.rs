//! Throttled, compressed batching of a live event stream.
//!
//! The batcher consumes the generation's event stream, groups events into
//! [`DeltaBatch`]es and hands each one to a [`BatchSink`] (usually the delta
//! store). It owns the session lifecycle: exactly one [`Termination`] is
//! reported, after which no further batch is emitted.
//!
//! Flushes are serialized through a [`FlushLane`]. A flush needs a non-empty
//! buffer and at least `throttle` since the previous flush, and happens:
//! - before a non-incremental event is buffered, so a type change opens a new
//!   batch;
//! - after a non-incremental event other than `metadata` is buffered, so a
//!   tool call or step marker is never held back until the next event;
//! - after an incremental delta is buffered, if the trailing delta text
//!   matches the boundary matcher (or no matcher is configured).
//!
//! A trailing `metadata` event waits for the next event or the final drain.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{Stream, StreamExt as _};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::compress::compress;
use crate::config::BatcherConfig;
use crate::errors::{BatchFailure, GenerationError, StoreError};
use crate::event::StreamEvent;
use crate::lane::FlushLane;
use crate::message::MessageMetadata;

/// Persistable slice `[start, end)` of a session's uncompressed event sequence.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeltaBatch {
    pub start: usize,
    pub end: usize,
    pub events: Vec<StreamEvent>,
}

/// Terminal outcome of a batcher. Reported exactly once.
#[derive(Clone, Debug, PartialEq)]
pub enum Termination {
    Finished,
    Aborted,
    Failed(BatchFailure),
}

/// Receiver of flushed batches and of the terminal outcome.
#[async_trait::async_trait]
pub trait BatchSink: Send + Sync {
    /// Persists one batch. An error fails the batcher.
    async fn on_delta(&self, batch: &DeltaBatch) -> Result<(), StoreError>;

    /// Called exactly once, after the last `on_delta` has settled.
    async fn on_terminal(&self, outcome: &Termination);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Active,
    /// `finish` won and is draining the buffer.
    Draining,
    Finished,
    Aborted,
    Failed,
}

#[derive(Default)]
struct Pending {
    events: Vec<StreamEvent>,
    /// Uncompressed index of `events[0]`.
    cursor: usize,
    last_flush: Option<Instant>,
    last_metadata: Option<MessageMetadata>,
}

/// Batches a session's event stream into persisted deltas.
pub struct DeltaBatcher {
    config: BatcherConfig,
    sink: Arc<dyn BatchSink>,
    signal: AbortSignal,
    lane: FlushLane,
    phase: Mutex<Phase>,
    pending: Mutex<Pending>,
    done: watch::Sender<Option<Termination>>,
    closed: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeltaBatcher {
    pub fn new(config: BatcherConfig, sink: Arc<dyn BatchSink>, signal: AbortSignal) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            config,
            sink,
            signal,
            lane: FlushLane::new(),
            phase: Mutex::new(Phase::Active),
            pending: Mutex::new(Pending::default()),
            done,
            closed: Notify::new(),
        }
    }

    /// Drives the batcher from `events` until a terminal outcome is reached.
    ///
    /// End of stream finishes, a stream error fails, and the abort signal
    /// aborts. Terminal calls made directly on the batcher also end the loop.
    pub async fn run<S>(self: Arc<Self>, events: S) -> Termination
    where
        S: Stream<Item = Result<StreamEvent, GenerationError>> + Send,
    {
        let mut events = std::pin::pin!(events);
        let mut signal = self.signal.clone();
        loop {
            tokio::select! {
                biased;
                _ = signal.aborted() => {
                    self.abort().await;
                    break;
                }
                _ = self.closed.notified() => break,
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        if let Err(err) = self.push(event).await {
                            self.fail(err.into()).await;
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "generation stream failed");
                        self.fail(err.into()).await;
                        break;
                    }
                    None => {
                        self.finish().await;
                        break;
                    }
                },
            }
        }
        self.terminated().await
    }

    /// Buffers one event and flushes when the flush rule allows.
    ///
    /// A no-op once the batcher left the active state.
    pub async fn push(&self, event: StreamEvent) -> Result<(), StoreError> {
        if !self.is_active() {
            return Ok(());
        }
        if !event.is_incremental() && self.flush_due() {
            self.flush().await?;
        }
        let held = matches!(event, StreamEvent::Metadata { .. });
        let flush_now = {
            let mut pending = lock(&self.pending);
            pending.events.push(event);
            match trailing_delta(&pending.events) {
                Some(text) => self
                    .config
                    .boundary
                    .as_ref()
                    .is_none_or(|re| re.is_match(&text)),
                None => !held,
            }
        };
        if flush_now && self.flush_due() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flushes everything still buffered and reports `Finished`.
    ///
    /// Returns false when another terminal transition already won.
    pub async fn finish(&self) -> bool {
        if !self.claim(Phase::Draining) {
            return false;
        }
        let drained = self.lane.run(self.flush_batch(true)).await;
        let outcome = match drained {
            Ok(()) => {
                *lock(&self.phase) = Phase::Finished;
                Termination::Finished
            }
            Err(err) => {
                *lock(&self.phase) = Phase::Failed;
                Termination::Failed(err.into())
            }
        };
        self.report(outcome).await;
        true
    }

    /// Reports `Aborted` once any in-flight flush settled.
    pub async fn abort(&self) -> bool {
        if !self.claim(Phase::Aborted) {
            return false;
        }
        self.lane.settle().await;
        self.report(Termination::Aborted).await;
        true
    }

    /// Reports `Failed` once any in-flight flush settled.
    pub async fn fail(&self, failure: BatchFailure) -> bool {
        if !self.claim(Phase::Failed) {
            return false;
        }
        self.lane.settle().await;
        self.report(Termination::Failed(failure)).await;
        true
    }

    /// Waits for the terminal outcome.
    pub async fn terminated(&self) -> Termination {
        let mut rx = self.done.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            // The sender lives as long as `self`.
            let _ = rx.changed().await;
        }
    }

    /// Terminal outcome, if already reported.
    pub fn outcome(&self) -> Option<Termination> {
        self.done.borrow().clone()
    }

    /// Flush lane used by this batcher.
    pub fn lane(&self) -> &FlushLane {
        &self.lane
    }

    fn is_active(&self) -> bool {
        *lock(&self.phase) == Phase::Active
    }

    fn claim(&self, next: Phase) -> bool {
        let mut phase = lock(&self.phase);
        if *phase != Phase::Active {
            return false;
        }
        *phase = next;
        true
    }

    async fn report(&self, outcome: Termination) {
        info!(outcome = ?outcome, "delta batcher terminated");
        self.sink.on_terminal(&outcome).await;
        self.done.send_replace(Some(outcome));
        self.closed.notify_one();
    }

    fn flush_due(&self) -> bool {
        let pending = lock(&self.pending);
        let throttled = pending
            .last_flush
            .is_some_and(|at| at.elapsed() < self.config.throttle);
        !pending.events.is_empty() && !throttled
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.lane.run(self.flush_batch(false)).await
    }

    /// Takes the whole buffer as one batch and hands it to the sink.
    ///
    /// Only the draining `finish` may flush outside the active state, so no
    /// batch follows a terminal outcome.
    async fn flush_batch(&self, draining: bool) -> Result<(), StoreError> {
        if draining {
            if *lock(&self.phase) != Phase::Draining {
                return Ok(());
            }
        } else if !self.is_active() || self.signal.is_aborted() {
            return Ok(());
        }

        let batch = {
            let mut pending = lock(&self.pending);
            if pending.events.is_empty() {
                return Ok(());
            }
            let raw = std::mem::take(&mut pending.events);
            let start = pending.cursor;
            let end = start + raw.len();
            pending.cursor = end;
            pending.last_flush = Some(Instant::now());
            let events = compress(&dedupe_metadata(raw, &mut pending.last_metadata));
            DeltaBatch { start, end, events }
        };

        debug!(
            start = batch.start,
            end = batch.end,
            events = batch.events.len(),
            "flushing delta batch"
        );
        self.sink.on_delta(&batch).await.inspect_err(|err| {
            warn!(start = batch.start, end = batch.end, error = %err, "persisting delta batch failed");
        })
    }
}

/// Concatenated text of the trailing run of same-part deltas, if the buffer
/// ends in an incremental delta.
fn trailing_delta(events: &[StreamEvent]) -> Option<String> {
    let last = events.last()?;
    last.delta_text()?;
    let mut run: Vec<&str> = Vec::new();
    for event in events.iter().rev() {
        let same_part = match (last, event) {
            (StreamEvent::TextDelta { id, .. }, StreamEvent::TextDelta { id: other, .. })
            | (
                StreamEvent::ReasoningDelta { id, .. },
                StreamEvent::ReasoningDelta { id: other, .. },
            ) => id == other,
            _ => false,
        };
        if !same_part {
            break;
        }
        run.extend(event.delta_text());
    }
    run.reverse();
    Some(run.concat())
}

/// Coalesces a batch's metadata events into one patch at the position of the
/// last one, dropping it entirely when it equals the last emitted patch.
fn dedupe_metadata(
    events: Vec<StreamEvent>,
    last_emitted: &mut Option<MessageMetadata>,
) -> Vec<StreamEvent> {
    let Some(last_index) = events
        .iter()
        .rposition(|event| matches!(event, StreamEvent::Metadata { .. }))
    else {
        return events;
    };

    let mut merged = MessageMetadata::default();
    for event in &events {
        if let StreamEvent::Metadata { message_metadata } = event {
            merged.merge(message_metadata);
        }
    }
    let keep = last_emitted.as_ref() != Some(&merged);

    let mut out = Vec::with_capacity(events.len());
    for (index, event) in events.into_iter().enumerate() {
        if !matches!(event, StreamEvent::Metadata { .. }) {
            out.push(event);
        } else if keep && index == last_index {
            out.push(StreamEvent::metadata(merged.clone()));
        }
    }
    if keep {
        *last_emitted = Some(merged);
    }
    out
}
