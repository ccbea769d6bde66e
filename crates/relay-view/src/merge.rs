//! Three-tier merge of persisted history, resumed streams and the local live
//! stream into one ordered message list.
//!
//! Each tier is recomputed only when its own input or an upstream tier
//! changed, tracked with explicit version counters:
//!
//! 1. base: history indexed by id, authoritative order for settled messages;
//! 2. buffer: resumed messages overwrite base entries in place or are
//!    appended without re-sorting;
//! 3. output: live messages overwrite buffer-added entries, then base
//!    entries, else are appended; one stable sort by `createdAt` follows.

use std::collections::HashMap;

use relay_core::{Message, MessageId};

#[derive(Default)]
struct Input {
    messages: Vec<Message>,
    version: u64,
}

impl Input {
    fn replace(&mut self, messages: Vec<Message>, version: u64) {
        self.messages = messages;
        self.version = version;
    }

    fn upsert(&mut self, message: Message, version: u64) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
        self.version = version;
    }

    fn remove(&mut self, id: &MessageId, version: u64) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != *id);
        let removed = self.messages.len() != before;
        if removed {
            self.version = version;
        }
        removed
    }
}

struct BaseTier {
    history: u64,
    messages: Vec<Message>,
    positions: HashMap<MessageId, usize>,
}

struct BufferTier {
    inputs: (u64, u64),
    messages: Vec<Message>,
    added: HashMap<MessageId, usize>,
}

struct OutputTier {
    inputs: (u64, u64, u64),
    messages: Vec<Message>,
}

/// How often each tier was recomputed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub base: usize,
    pub buffer: usize,
    pub output: usize,
}

/// Unified merge engine over the history, resumed and live tiers.
#[derive(Default)]
pub struct MessageMerge {
    clock: u64,
    history: Input,
    resumed: Input,
    live: Input,
    base: Option<BaseTier>,
    buffer: Option<BufferTier>,
    output: Option<OutputTier>,
    stats: MergeStats,
}

impl MessageMerge {
    /// Empty merge; the first [`merged`](Self::merged) computes every tier.
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Replaces the persisted history. Expected in `createdAt` order.
    pub fn set_history(&mut self, messages: Vec<Message>) {
        let version = self.tick();
        self.history.replace(messages, version);
    }

    /// Inserts or replaces one history entry, e.g. a stream that just
    /// finalized.
    pub fn upsert_history(&mut self, message: Message) {
        let version = self.tick();
        self.history.upsert(message, version);
    }

    /// Replaces every message reconstructed from other readers' streams.
    pub fn set_resumed(&mut self, messages: Vec<Message>) {
        let version = self.tick();
        self.resumed.replace(messages, version);
    }

    /// Inserts or replaces one resumed message.
    pub fn upsert_resumed(&mut self, message: Message) {
        let version = self.tick();
        self.resumed.upsert(message, version);
    }

    /// Drops a resumed message. Returns whether it was present.
    pub fn remove_resumed(&mut self, id: &MessageId) -> bool {
        let version = self.tick();
        self.resumed.remove(id, version)
    }

    /// Replaces the local live stream's messages.
    pub fn set_live(&mut self, messages: Vec<Message>) {
        let version = self.tick();
        self.live.replace(messages, version);
    }

    /// Inserts or replaces one live message. Live entries take precedence
    /// over resumed and history entries with the same id.
    pub fn upsert_live(&mut self, message: Message) {
        let version = self.tick();
        self.live.upsert(message, version);
    }

    /// Drops a live message. Returns whether it was present.
    pub fn remove_live(&mut self, id: &MessageId) -> bool {
        let version = self.tick();
        self.live.remove(id, version)
    }

    /// Recomputation counts per tier so far.
    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    /// Returns the merged, de-duplicated list sorted by `createdAt`.
    pub fn merged(&mut self) -> &[Message] {
        self.refresh_base();
        self.refresh_buffer();
        self.refresh_output();
        self.output
            .as_ref()
            .map_or(&[][..], |output| output.messages.as_slice())
    }

    fn refresh_base(&mut self) {
        if self
            .base
            .as_ref()
            .is_some_and(|base| base.history == self.history.version)
        {
            return;
        }
        let mut messages: Vec<Message> = Vec::with_capacity(self.history.messages.len());
        let mut positions = HashMap::new();
        for message in &self.history.messages {
            match positions.get(&message.id) {
                Some(&index) => messages[index] = message.clone(),
                None => {
                    positions.insert(message.id.clone(), messages.len());
                    messages.push(message.clone());
                }
            }
        }
        self.base = Some(BaseTier {
            history: self.history.version,
            messages,
            positions,
        });
        self.stats.base += 1;
    }

    fn refresh_buffer(&mut self) {
        let Some(base) = &self.base else { return };
        let inputs = (base.history, self.resumed.version);
        if self
            .buffer
            .as_ref()
            .is_some_and(|buffer| buffer.inputs == inputs)
        {
            return;
        }
        let mut messages = base.messages.clone();
        let mut added = HashMap::new();
        for message in &self.resumed.messages {
            let slot = base
                .positions
                .get(&message.id)
                .or_else(|| added.get(&message.id))
                .copied();
            match slot {
                Some(index) => messages[index] = message.clone(),
                None => {
                    added.insert(message.id.clone(), messages.len());
                    messages.push(message.clone());
                }
            }
        }
        self.buffer = Some(BufferTier {
            inputs,
            messages,
            added,
        });
        self.stats.buffer += 1;
    }

    fn refresh_output(&mut self) {
        let (Some(base), Some(buffer)) = (&self.base, &self.buffer) else {
            return;
        };
        let inputs = (buffer.inputs.0, buffer.inputs.1, self.live.version);
        if self
            .output
            .as_ref()
            .is_some_and(|output| output.inputs == inputs)
        {
            return;
        }
        let mut messages = buffer.messages.clone();
        let mut appended: HashMap<MessageId, usize> = HashMap::new();
        for message in &self.live.messages {
            let slot = buffer
                .added
                .get(&message.id)
                .or_else(|| base.positions.get(&message.id))
                .or_else(|| appended.get(&message.id))
                .copied();
            match slot {
                Some(index) => messages[index] = message.clone(),
                None => {
                    appended.insert(message.id.clone(), messages.len());
                    messages.push(message.clone());
                }
            }
        }
        messages.sort_by_key(Message::created_at);
        self.output = Some(OutputTier { inputs, messages });
        self.stats.output += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use relay_core::{LiveStatus, MessageMetadata};

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(millis).unwrap()
    }

    fn msg(id: &str, created_ms: i64) -> Message {
        Message::assistant(id).with_metadata(
            MessageMetadata::with_status(LiveStatus::Completed).created_at(at(created_ms)),
        )
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn resumed_update_and_live_insert_are_ordered_by_creation() {
        let mut merge = MessageMerge::new();
        merge.set_history(vec![msg("A", 1000), msg("B", 2000)]);

        let mut updated = Message::user_text("A", "edited");
        updated.metadata = MessageMetadata::with_status(LiveStatus::Streaming).created_at(at(1000));
        merge.upsert_resumed(updated.clone());
        merge.upsert_live(msg("C", 1500));

        let merged = merge.merged();
        assert_eq!(ids(merged), vec!["A", "C", "B"]);
        assert_eq!(merged[0], updated);
    }

    #[test]
    fn output_holds_each_id_once_in_creation_order() {
        let mut merge = MessageMerge::new();
        merge.set_history(vec![msg("h1", 10), msg("h2", 30), msg("h3", 50)]);
        merge.set_resumed(vec![msg("r1", 40), msg("h2", 30), msg("r2", 5)]);
        merge.set_live(vec![msg("l1", 20), msg("r1", 40), msg("l2", 60)]);

        let merged = merge.merged();
        assert_eq!(merged.len(), 7);
        assert_eq!(ids(merged), vec!["r2", "h1", "l1", "h2", "r1", "h3", "l2"]);
        assert!(
            merged
                .windows(2)
                .all(|pair| pair[0].created_at() <= pair[1].created_at())
        );
    }

    #[test]
    fn live_message_replaces_buffer_added_entry() {
        let mut merge = MessageMerge::new();
        merge.set_history(vec![msg("A", 1)]);
        merge.upsert_resumed(
            Message::assistant("N").with_metadata(
                MessageMetadata::with_status(LiveStatus::Streaming).created_at(at(2)),
            ),
        );
        merge.upsert_live(msg("N", 2));

        let merged = merge.merged();
        assert_eq!(ids(merged), vec!["A", "N"]);
        assert_eq!(merged[1].live_status(), LiveStatus::Completed);
    }

    #[test]
    fn equal_timestamps_keep_tier_precedence_order() {
        let mut merge = MessageMerge::new();
        merge.set_history(vec![msg("base", 7)]);
        merge.set_resumed(vec![msg("buffer", 7)]);
        merge.set_live(vec![msg("live", 7)]);
        assert_eq!(ids(merge.merged()), vec!["base", "buffer", "live"]);
    }

    #[test]
    fn messages_without_creation_time_sort_first() {
        let mut merge = MessageMerge::new();
        merge.set_history(vec![msg("old", 1)]);
        merge.upsert_live(Message::assistant("draft"));
        assert_eq!(ids(merge.merged()), vec!["draft", "old"]);
    }

    #[test]
    fn only_changed_tiers_are_recomputed() {
        let mut merge = MessageMerge::new();
        merge.set_history(vec![msg("A", 1)]);
        merge.merged();
        assert_eq!(
            merge.stats(),
            MergeStats {
                base: 1,
                buffer: 1,
                output: 1
            }
        );

        merge.merged();
        assert_eq!(merge.stats().output, 1);

        merge.upsert_live(msg("L", 2));
        merge.merged();
        assert_eq!(
            merge.stats(),
            MergeStats {
                base: 1,
                buffer: 1,
                output: 2
            }
        );

        merge.upsert_resumed(msg("R", 3));
        merge.merged();
        assert_eq!(
            merge.stats(),
            MergeStats {
                base: 1,
                buffer: 2,
                output: 3
            }
        );

        merge.upsert_history(msg("B", 4));
        assert_eq!(merge.merged().len(), 4);
        assert_eq!(
            merge.stats(),
            MergeStats {
                base: 2,
                buffer: 3,
                output: 4
            }
        );
    }

    /// Tier inputs with ids drawn from a small shared pool so tiers overlap,
    /// and coarse timestamps (some missing) so ties are common.
    fn arb_tier(prefix: &'static str) -> impl Strategy<Value = Vec<Message>> {
        prop::collection::vec((0_u8..6, prop::option::weighted(0.9, 0_i64..4)), 0..6).prop_map(
            move |entries| {
                let mut seen = std::collections::HashSet::new();
                entries
                    .into_iter()
                    .filter(|(id, _)| seen.insert(*id))
                    .map(|(id, created)| {
                        let mut metadata = MessageMetadata::with_status(LiveStatus::Completed);
                        metadata.created_at = created.map(at);
                        metadata.extra.insert("tier".into(), prefix.into());
                        Message::assistant(format!("m{id}")).with_metadata(metadata)
                    })
                    .collect()
            },
        )
    }

    fn tier_of(message: &Message) -> &str {
        message.metadata.extra["tier"].as_str().unwrap_or_default()
    }

    proptest! {
        #[test]
        fn prop_merge_is_sorted_unique_and_prefers_higher_tiers(
            history in arb_tier("history"),
            resumed in arb_tier("resumed"),
            live in arb_tier("live"),
        ) {
            let mut merge = MessageMerge::new();
            merge.set_history(history.clone());
            merge.set_resumed(resumed.clone());
            merge.set_live(live.clone());
            let merged = merge.merged().to_vec();

            prop_assert!(merged.windows(2).all(|pair| pair[0].created_at() <= pair[1].created_at()));

            let mut expected: HashMap<MessageId, &str> = HashMap::new();
            for (tier, messages) in [("history", &history), ("resumed", &resumed), ("live", &live)] {
                for message in messages {
                    expected.insert(message.id.clone(), tier);
                }
            }
            prop_assert_eq!(merged.len(), expected.len());
            for message in &merged {
                prop_assert_eq!(expected.get(&message.id).copied(), Some(tier_of(message)));
            }

            // Settled history messages keep their relative order on ties.
            let untouched: Vec<&Message> = history
                .iter()
                .filter(|m| !resumed.iter().chain(&live).any(|o| o.id == m.id))
                .collect();
            let positions: HashMap<&MessageId, usize> =
                merged.iter().enumerate().map(|(i, m)| (&m.id, i)).collect();
            for (i, a) in untouched.iter().enumerate() {
                for b in &untouched[i + 1..] {
                    if a.created_at() == b.created_at() {
                        prop_assert!(positions[&a.id] < positions[&b.id]);
                    }
                }
            }

            let mut rebuilt = MessageMerge::new();
            rebuilt.set_live(live);
            rebuilt.set_resumed(resumed);
            rebuilt.set_history(history);
            prop_assert_eq!(rebuilt.merged(), merged.as_slice());
        }
    }

    #[test]
    fn removing_a_resumed_message_drops_it_from_output() {
        let mut merge = MessageMerge::new();
        merge.upsert_resumed(msg("R", 1));
        assert_eq!(merge.merged().len(), 1);
        assert!(merge.remove_resumed(&MessageId::new("R")));
        assert!(merge.merged().is_empty());
        assert!(!merge.remove_resumed(&MessageId::new("R")));
    }
}
